use crate::clock::Clock;
use crate::db::Store;
use crate::error::StoreError;
use crate::stats::aggregator::{ListeningSummary, TOP_N, compute_stats};
use crate::week::{WeekWindow, week_identifier, week_window};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Members shown on a workspace leaderboard.
pub const LEADERBOARD_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowKind {
    /// The stored stat of the latest calendar week.
    #[serde(rename = "week")]
    CalendarWeek,
    /// The last seven days, computed on demand.
    #[serde(rename = "rolling")]
    Rolling7Days,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsView {
    pub linked_account_id: Uuid,
    pub window: WindowKind,
    /// Only set for calendar weeks.
    pub week_identifier: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(flatten)]
    pub summary: ListeningSummary,
    /// No stored play predates the window, so it may cover less than a full week of history.
    pub includes_earliest_data: bool,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub slack_user_id: String,
    pub linked_account_id: Uuid,
    pub total_minutes: i32,
    pub total_plays: i32,
}

/// Read side of the stats: stored weeks and the rolling seven-day view.
pub struct StatsService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    grace: Duration,
    cache_ttl: Duration,
    rolling_cache: RwLock<HashMap<Uuid, StatsView>>,
}

impl StatsService {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        grace: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            grace,
            cache_ttl,
            rolling_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Stats for one linked account, `None` when there is nothing to show.
    ///
    /// A calendar-week lookup falls back to the week before when the current
    /// one has no stored stat yet.
    pub async fn get_weekly_stats(
        &self,
        linked_account_id: Uuid,
        window: WindowKind,
    ) -> Result<Option<StatsView>, StoreError> {
        match window {
            WindowKind::CalendarWeek => self.calendar_week(linked_account_id).await,
            WindowKind::Rolling7Days => self.rolling(linked_account_id).await,
        }
    }

    /// Up to five members of a Slack workspace, most minutes listened first.
    pub async fn get_workspace_stats(
        &self,
        slack_workspace_id: &str,
        window: WindowKind,
    ) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let associations = self
            .store
            .list_workspace_associations(slack_workspace_id)
            .await?;

        let mut entries = Vec::new();
        for association in associations {
            if let Some(view) = self
                .get_weekly_stats(association.linked_account_id, window)
                .await?
            {
                entries.push(LeaderboardEntry {
                    slack_user_id: association.slack_user_id,
                    linked_account_id: association.linked_account_id,
                    total_minutes: view.summary.total_minutes,
                    total_plays: view.summary.total_plays,
                });
            }
        }

        let entries = rank(entries);

        tracing::debug!(
            slack_workspace_id = slack_workspace_id,
            window = ?window,
            members = entries.len(),
            "Built workspace leaderboard"
        );

        Ok(entries)
    }

    /// Leaderboard for one stored week. Members without a stat for that
    /// exact week are left out.
    pub async fn get_workspace_week(
        &self,
        slack_workspace_id: &str,
        week_identifier: &str,
    ) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let associations = self
            .store
            .list_workspace_associations(slack_workspace_id)
            .await?;

        let mut entries = Vec::new();
        for association in associations {
            if let Some(stat) = self
                .store
                .get_weekly_stat(association.linked_account_id, week_identifier)
                .await?
            {
                entries.push(LeaderboardEntry {
                    slack_user_id: association.slack_user_id,
                    linked_account_id: association.linked_account_id,
                    total_minutes: stat.total_minutes,
                    total_plays: stat.total_plays,
                });
            }
        }

        Ok(rank(entries))
    }

    async fn calendar_week(&self, linked_account_id: Uuid) -> Result<Option<StatsView>, StoreError> {
        let current = week_window(self.clock.now(), self.grace);
        let start = current.start - Duration::days(7);
        let previous = WeekWindow {
            identifier: week_identifier(start.date_naive()),
            start,
            end: current.start - Duration::seconds(1),
        };

        for week in [current, previous] {
            let Some(stat) = self
                .store
                .get_weekly_stat(linked_account_id, &week.identifier)
                .await?
            else {
                continue;
            };

            let includes_earliest_data = !self
                .store
                .has_plays_before(linked_account_id, stat.week_start)
                .await?;

            return Ok(Some(StatsView {
                linked_account_id,
                window: WindowKind::CalendarWeek,
                week_identifier: Some(stat.week_identifier.clone()),
                start: stat.week_start,
                end: stat.week_end,
                summary: ListeningSummary::from(&stat),
                includes_earliest_data,
                computed_at: stat.computed_at,
            }));
        }

        Ok(None)
    }

    async fn rolling(&self, linked_account_id: Uuid) -> Result<Option<StatsView>, StoreError> {
        let now = self.clock.now();

        if let Some(cached) = self.cached(linked_account_id, now) {
            tracing::debug!(
                linked_account_id = %linked_account_id,
                computed_at = %cached.computed_at,
                "Serving rolling stats from cache"
            );
            return Ok(Some(cached));
        }

        let start = now - Duration::days(7);
        let plays = self
            .store
            .plays_between(linked_account_id, start, now)
            .await?;
        if plays.is_empty() {
            return Ok(None);
        }

        let includes_earliest_data = !self.store.has_plays_before(linked_account_id, start).await?;

        let view = StatsView {
            linked_account_id,
            window: WindowKind::Rolling7Days,
            week_identifier: None,
            start,
            end: now,
            summary: compute_stats(&plays, TOP_N),
            includes_earliest_data,
            computed_at: now,
        };

        let mut cache = self.rolling_cache.write().unwrap_or_else(|e| e.into_inner());
        cache.retain(|_, cached| now - cached.computed_at < self.cache_ttl);
        cache.insert(linked_account_id, view.clone());

        Ok(Some(view))
    }

    fn cached(&self, linked_account_id: Uuid, now: DateTime<Utc>) -> Option<StatsView> {
        self.rolling_cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&linked_account_id)
            .filter(|view| now - view.computed_at < self.cache_ttl)
            .cloned()
    }
}

/// Most minutes first, capped at the leaderboard size.
fn rank(mut entries: Vec<LeaderboardEntry>) -> Vec<LeaderboardEntry> {
    entries.sort_by(|a, b| b.total_minutes.cmp(&a.total_minutes));
    entries.truncate(LEADERBOARD_SIZE);
    entries
}
