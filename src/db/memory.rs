//! In-process [`Store`] with the same uniqueness rules as the Postgres schema.
//!
//! Backs the unit tests and is handy for running the pipeline without a database.

use crate::db::models::{
    Association, IngestionCursor, LinkedAccount, NewPlayEvent, NewWeeklyStat, PlayEvent,
    SlackWorkspace, WeeklyStat,
};
use crate::db::{Store, StoreResult, WeeklyStatInsert};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    accounts: HashMap<Uuid, LinkedAccount>,
    associations: Vec<Association>,
    cursors: HashMap<Uuid, IngestionCursor>,
    plays: Vec<PlayEvent>,
    weekly_stats: Vec<WeeklyStat>,
    workspaces: HashMap<String, SlackWorkspace>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_linked_account(&self, account: LinkedAccount) {
        self.lock().accounts.insert(account.id, account);
    }

    pub fn add_association(
        &self,
        linked_account_id: Uuid,
        slack_workspace_id: &str,
        slack_user_id: &str,
        workspace_name: &str,
    ) -> Association {
        let association = Association {
            id: Uuid::new_v4(),
            linked_account_id,
            slack_workspace_id: slack_workspace_id.to_string(),
            slack_user_id: slack_user_id.to_string(),
            workspace_name: workspace_name.to_string(),
            connected_at: Utc::now(),
        };
        self.lock().associations.push(association.clone());
        association
    }

    /// Install the bot in a workspace, with no leaderboard channel.
    pub fn add_slack_workspace(&self, slack_workspace_id: &str, bot_token: &str) -> SlackWorkspace {
        let workspace = SlackWorkspace {
            slack_workspace_id: slack_workspace_id.to_string(),
            bot_token: bot_token.to_string(),
            stats_channel_id: None,
            stats_enabled: true,
            installed_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.lock()
            .workspaces
            .insert(workspace.slack_workspace_id.clone(), workspace.clone());
        workspace
    }

    pub fn set_stats_channel(&self, slack_workspace_id: &str, channel: Option<&str>, enabled: bool) {
        if let Some(workspace) = self.lock().workspaces.get_mut(slack_workspace_id) {
            workspace.stats_channel_id = channel.map(str::to_string);
            workspace.stats_enabled = enabled;
            workspace.updated_at = Utc::now();
        }
    }

    pub fn set_cursor(&self, cursor: IngestionCursor) {
        self.lock().cursors.insert(cursor.linked_account_id, cursor);
    }

    /// Store a play directly, bypassing ingestion. Returns false on a duplicate key.
    pub fn insert_play(&self, linked_account_id: Uuid, event: &NewPlayEvent) -> bool {
        insert_play(&mut self.lock(), linked_account_id, event)
    }

    pub fn plays(&self, linked_account_id: Uuid) -> Vec<PlayEvent> {
        self.lock()
            .plays
            .iter()
            .filter(|p| p.linked_account_id == linked_account_id)
            .cloned()
            .collect()
    }

    pub fn weekly_stats(&self, linked_account_id: Uuid) -> Vec<WeeklyStat> {
        self.lock()
            .weekly_stats
            .iter()
            .filter(|s| s.linked_account_id == linked_account_id)
            .cloned()
            .collect()
    }
}

fn insert_play(inner: &mut Inner, linked_account_id: Uuid, event: &NewPlayEvent) -> bool {
    let duplicate = inner.plays.iter().any(|p| {
        p.linked_account_id == linked_account_id
            && p.track_id == event.track_id
            && p.played_at == event.played_at
    });
    if duplicate {
        return false;
    }

    inner.plays.push(PlayEvent {
        id: Uuid::new_v4(),
        linked_account_id,
        track_id: event.track_id.clone(),
        track_name: event.track_name.clone(),
        artists: event.artists.clone(),
        album_name: event.album_name.clone(),
        duration_ms: event.duration_ms,
        played_at: event.played_at,
        context_type: event.context_type.clone(),
        context_uri: event.context_uri.clone(),
        created_at: Utc::now(),
    });
    true
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_linked_accounts(&self) -> StoreResult<Vec<LinkedAccount>> {
        let mut accounts: Vec<_> = self.lock().accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    async fn get_linked_account(&self, id: Uuid) -> StoreResult<Option<LinkedAccount>> {
        Ok(self.lock().accounts.get(&id).cloned())
    }

    async fn update_credentials(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some(account) = self.lock().accounts.get_mut(&id) {
            account.access_token = access_token.to_string();
            if let Some(refresh_token) = refresh_token {
                account.refresh_token = refresh_token.to_string();
            }
            account.expires_at = expires_at;
            account.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_associations(&self, linked_account_id: Uuid) -> StoreResult<Vec<Association>> {
        Ok(self
            .lock()
            .associations
            .iter()
            .filter(|a| a.linked_account_id == linked_account_id)
            .cloned()
            .collect())
    }

    async fn list_workspace_associations(
        &self,
        slack_workspace_id: &str,
    ) -> StoreResult<Vec<Association>> {
        Ok(self
            .lock()
            .associations
            .iter()
            .filter(|a| a.slack_workspace_id == slack_workspace_id)
            .cloned()
            .collect())
    }

    async fn remove_associations(
        &self,
        linked_account_id: Uuid,
        association_ids: &[Uuid],
    ) -> StoreResult<u64> {
        let mut inner = self.lock();
        let before = inner.associations.len();
        inner.associations.retain(|a| {
            !(a.linked_account_id == linked_account_id && association_ids.contains(&a.id))
        });
        let removed = (before - inner.associations.len()) as u64;
        inner.cursors.remove(&linked_account_id);
        Ok(removed)
    }

    async fn get_cursor(&self, linked_account_id: Uuid) -> StoreResult<Option<IngestionCursor>> {
        Ok(self.lock().cursors.get(&linked_account_id).cloned())
    }

    async fn existing_play_keys(
        &self,
        linked_account_id: Uuid,
        track_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<HashSet<(String, DateTime<Utc>)>> {
        Ok(self
            .lock()
            .plays
            .iter()
            .filter(|p| {
                p.linked_account_id == linked_account_id
                    && track_ids.contains(&p.track_id)
                    && p.played_at >= from
                    && p.played_at <= to
            })
            .map(|p| (p.track_id.clone(), p.played_at))
            .collect())
    }

    async fn commit_ingestion(
        &self,
        linked_account_id: Uuid,
        events: &[NewPlayEvent],
        last_fetched_at: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut inner = self.lock();
        let mut inserted = 0u64;
        for event in events {
            if insert_play(&mut inner, linked_account_id, event) {
                inserted += 1;
            }
        }

        inner.cursors.insert(
            linked_account_id,
            IngestionCursor {
                linked_account_id,
                last_fetched_at: Some(last_fetched_at),
                tracks_fetched_in_last_run: inserted as i32,
                last_run_at: run_at,
            },
        );

        Ok(inserted)
    }

    async fn plays_between(
        &self,
        linked_account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<PlayEvent>> {
        let mut plays: Vec<_> = self
            .lock()
            .plays
            .iter()
            .filter(|p| {
                p.linked_account_id == linked_account_id && p.played_at >= from && p.played_at <= to
            })
            .cloned()
            .collect();
        // Stable, so insertion order breaks ties like created_at does in Postgres
        plays.sort_by_key(|p| p.played_at);
        Ok(plays)
    }

    async fn has_plays_before(
        &self,
        linked_account_id: Uuid,
        before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        Ok(self
            .lock()
            .plays
            .iter()
            .any(|p| p.linked_account_id == linked_account_id && p.played_at < before))
    }

    async fn get_weekly_stat(
        &self,
        linked_account_id: Uuid,
        week_identifier: &str,
    ) -> StoreResult<Option<WeeklyStat>> {
        Ok(self
            .lock()
            .weekly_stats
            .iter()
            .find(|s| s.linked_account_id == linked_account_id && s.week_identifier == week_identifier)
            .cloned())
    }

    async fn insert_weekly_stat_if_absent(
        &self,
        stat: &NewWeeklyStat,
    ) -> StoreResult<WeeklyStatInsert> {
        let mut inner = self.lock();
        if let Some(existing) = inner.weekly_stats.iter().find(|s| {
            s.linked_account_id == stat.linked_account_id
                && s.week_identifier == stat.week_identifier
        }) {
            return Ok(WeeklyStatInsert::Existing(existing.clone()));
        }

        let stored = WeeklyStat {
            id: Uuid::new_v4(),
            linked_account_id: stat.linked_account_id,
            week_identifier: stat.week_identifier.clone(),
            week_start: stat.week_start,
            week_end: stat.week_end,
            top_tracks: stat.top_tracks.clone(),
            top_artists: stat.top_artists.clone(),
            total_minutes: stat.total_minutes,
            total_plays: stat.total_plays,
            unique_tracks: stat.unique_tracks,
            computed_at: stat.computed_at,
        };
        inner.weekly_stats.push(stored.clone());
        Ok(WeeklyStatInsert::Inserted(stored))
    }

    async fn get_slack_workspace(
        &self,
        slack_workspace_id: &str,
    ) -> StoreResult<Option<SlackWorkspace>> {
        Ok(self.lock().workspaces.get(slack_workspace_id).cloned())
    }

    async fn list_leaderboard_workspaces(&self) -> StoreResult<Vec<SlackWorkspace>> {
        let mut workspaces: Vec<_> = self
            .lock()
            .workspaces
            .values()
            .filter(|w| w.leaderboard_channel().is_some())
            .cloned()
            .collect();
        workspaces.sort_by(|a, b| a.slack_workspace_id.cmp(&b.slack_workspace_id));
        Ok(workspaces)
    }
}
