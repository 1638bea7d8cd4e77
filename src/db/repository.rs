use crate::db::models::{
    Association, IngestionCursor, LinkedAccount, NewPlayEvent, NewWeeklyStat, PlayEvent,
    SlackWorkspace, WeeklyStat,
};
use crate::db::{Store, StoreResult, WeeklyStatInsert};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::HashSet;
use uuid::Uuid;

/// Postgres-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert or update a linked account by Spotify user id.
    ///
    /// Used by the account-linking flow and by tests; the pipeline itself
    /// only ever updates credentials.
    ///
    /// # Arguments
    /// * `spotify_user_id` - Spotify's id for the account
    /// * `access_token` - Spotify access token
    /// * `refresh_token` - Spotify refresh token
    /// * `expires_at` - Access token expiration timestamp
    /// * `client_id` - Client id for client-bound links, `None` for shared-secret links
    ///
    /// # Returns
    /// The created or updated LinkedAccount record
    pub async fn upsert_linked_account(
        &self,
        spotify_user_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
        client_id: Option<&str>,
    ) -> StoreResult<LinkedAccount> {
        let account = sqlx::query_as::<_, LinkedAccount>(
            r#"
            INSERT INTO linked_accounts (
                spotify_user_id,
                access_token,
                refresh_token,
                expires_at,
                client_id
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (spotify_user_id)
            DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                expires_at = EXCLUDED.expires_at,
                client_id = EXCLUDED.client_id,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(spotify_user_id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(client_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(account)
    }

    /// Attach a Slack user in a workspace to a linked account.
    ///
    /// A Slack user tracks at most one account per workspace; re-linking
    /// moves the association.
    pub async fn upsert_association(
        &self,
        linked_account_id: Uuid,
        slack_workspace_id: &str,
        slack_user_id: &str,
        workspace_name: &str,
    ) -> StoreResult<Association> {
        let association = sqlx::query_as::<_, Association>(
            r#"
            INSERT INTO associations (
                linked_account_id,
                slack_workspace_id,
                slack_user_id,
                workspace_name
            )
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (slack_workspace_id, slack_user_id)
            DO UPDATE SET
                linked_account_id = EXCLUDED.linked_account_id,
                workspace_name = EXCLUDED.workspace_name,
                connected_at = NOW()
            RETURNING *
            "#,
        )
        .bind(linked_account_id)
        .bind(slack_workspace_id)
        .bind(slack_user_id)
        .bind(workspace_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(association)
    }

    /// Record the bot token for a workspace, keeping its leaderboard settings.
    pub async fn upsert_slack_workspace(
        &self,
        slack_workspace_id: &str,
        bot_token: &str,
    ) -> StoreResult<SlackWorkspace> {
        let workspace = sqlx::query_as::<_, SlackWorkspace>(
            r#"
            INSERT INTO slack_workspaces (slack_workspace_id, bot_token)
            VALUES ($1, $2)
            ON CONFLICT (slack_workspace_id)
            DO UPDATE SET
                bot_token = EXCLUDED.bot_token,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(slack_workspace_id)
        .bind(bot_token)
        .fetch_one(&self.pool)
        .await?;

        Ok(workspace)
    }

    /// Choose where the weekly leaderboard goes, or switch it off.
    pub async fn set_stats_channel(
        &self,
        slack_workspace_id: &str,
        stats_channel_id: Option<&str>,
        stats_enabled: bool,
    ) -> StoreResult<Option<SlackWorkspace>> {
        let workspace = sqlx::query_as::<_, SlackWorkspace>(
            r#"
            UPDATE slack_workspaces
            SET stats_channel_id = $2, stats_enabled = $3, updated_at = NOW()
            WHERE slack_workspace_id = $1
            RETURNING *
            "#,
        )
        .bind(slack_workspace_id)
        .bind(stats_channel_id)
        .bind(stats_enabled)
        .fetch_optional(&self.pool)
        .await?;

        Ok(workspace)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn list_linked_accounts(&self) -> StoreResult<Vec<LinkedAccount>> {
        let accounts = sqlx::query_as::<_, LinkedAccount>(
            "SELECT * FROM linked_accounts ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn get_linked_account(&self, id: Uuid) -> StoreResult<Option<LinkedAccount>> {
        let account =
            sqlx::query_as::<_, LinkedAccount>("SELECT * FROM linked_accounts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(account)
    }

    async fn update_credentials(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        // COALESCE keeps the stored refresh token when Spotify did not rotate it
        sqlx::query(
            r#"
            UPDATE linked_accounts
            SET
                access_token = $1,
                refresh_token = COALESCE($2, refresh_token),
                expires_at = $3,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_associations(&self, linked_account_id: Uuid) -> StoreResult<Vec<Association>> {
        let associations = sqlx::query_as::<_, Association>(
            r#"
            SELECT * FROM associations
            WHERE linked_account_id = $1
            ORDER BY connected_at
            "#,
        )
        .bind(linked_account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(associations)
    }

    async fn list_workspace_associations(
        &self,
        slack_workspace_id: &str,
    ) -> StoreResult<Vec<Association>> {
        let associations = sqlx::query_as::<_, Association>(
            r#"
            SELECT * FROM associations
            WHERE slack_workspace_id = $1
            ORDER BY connected_at
            "#,
        )
        .bind(slack_workspace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(associations)
    }

    async fn remove_associations(
        &self,
        linked_account_id: Uuid,
        association_ids: &[Uuid],
    ) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            "DELETE FROM associations WHERE linked_account_id = $1 AND id = ANY($2)",
        )
        .bind(linked_account_id)
        .bind(association_ids.to_vec())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM ingestion_cursors WHERE linked_account_id = $1")
            .bind(linked_account_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(removed)
    }

    async fn get_cursor(&self, linked_account_id: Uuid) -> StoreResult<Option<IngestionCursor>> {
        let cursor = sqlx::query_as::<_, IngestionCursor>(
            "SELECT * FROM ingestion_cursors WHERE linked_account_id = $1",
        )
        .bind(linked_account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(cursor)
    }

    async fn existing_play_keys(
        &self,
        linked_account_id: Uuid,
        track_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<HashSet<(String, DateTime<Utc>)>> {
        let rows = sqlx::query_as::<_, (String, DateTime<Utc>)>(
            r#"
            SELECT track_id, played_at FROM play_events
            WHERE linked_account_id = $1
                AND track_id = ANY($2)
                AND played_at >= $3
                AND played_at <= $4
            "#,
        )
        .bind(linked_account_id)
        .bind(track_ids.to_vec())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn commit_ingestion(
        &self,
        linked_account_id: Uuid,
        events: &[NewPlayEvent],
        last_fetched_at: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for event in events {
            // A concurrent writer may have stored the same play since the
            // existence check; the unique index turns that into a no-op.
            let result = sqlx::query(
                r#"
                INSERT INTO play_events (
                    linked_account_id,
                    track_id,
                    track_name,
                    artists,
                    album_name,
                    duration_ms,
                    played_at,
                    context_type,
                    context_uri
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (linked_account_id, track_id, played_at) DO NOTHING
                "#,
            )
            .bind(linked_account_id)
            .bind(&event.track_id)
            .bind(&event.track_name)
            .bind(Json(&event.artists))
            .bind(&event.album_name)
            .bind(event.duration_ms)
            .bind(event.played_at)
            .bind(event.context_type.as_deref())
            .bind(event.context_uri.as_deref())
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        sqlx::query(
            r#"
            INSERT INTO ingestion_cursors (
                linked_account_id,
                last_fetched_at,
                tracks_fetched_in_last_run,
                last_run_at
            )
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (linked_account_id)
            DO UPDATE SET
                last_fetched_at = EXCLUDED.last_fetched_at,
                tracks_fetched_in_last_run = EXCLUDED.tracks_fetched_in_last_run,
                last_run_at = EXCLUDED.last_run_at
            "#,
        )
        .bind(linked_account_id)
        .bind(last_fetched_at)
        .bind(inserted as i32)
        .bind(run_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(inserted)
    }

    async fn plays_between(
        &self,
        linked_account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<PlayEvent>> {
        let plays = sqlx::query_as::<_, PlayEvent>(
            r#"
            SELECT * FROM play_events
            WHERE linked_account_id = $1
                AND played_at >= $2
                AND played_at <= $3
            ORDER BY played_at, created_at
            "#,
        )
        .bind(linked_account_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(plays)
    }

    async fn has_plays_before(
        &self,
        linked_account_id: Uuid,
        before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM play_events
                WHERE linked_account_id = $1 AND played_at < $2
            )
            "#,
        )
        .bind(linked_account_id)
        .bind(before)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn get_weekly_stat(
        &self,
        linked_account_id: Uuid,
        week_identifier: &str,
    ) -> StoreResult<Option<WeeklyStat>> {
        let stat = sqlx::query_as::<_, WeeklyStat>(
            r#"
            SELECT * FROM weekly_stats
            WHERE linked_account_id = $1 AND week_identifier = $2
            "#,
        )
        .bind(linked_account_id)
        .bind(week_identifier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stat)
    }

    async fn insert_weekly_stat_if_absent(
        &self,
        stat: &NewWeeklyStat,
    ) -> StoreResult<WeeklyStatInsert> {
        let inserted = sqlx::query_as::<_, WeeklyStat>(
            r#"
            INSERT INTO weekly_stats (
                linked_account_id,
                week_identifier,
                week_start,
                week_end,
                top_tracks,
                top_artists,
                total_minutes,
                total_plays,
                unique_tracks,
                computed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (linked_account_id, week_identifier) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(stat.linked_account_id)
        .bind(&stat.week_identifier)
        .bind(stat.week_start)
        .bind(stat.week_end)
        .bind(Json(&stat.top_tracks))
        .bind(Json(&stat.top_artists))
        .bind(stat.total_minutes)
        .bind(stat.total_plays)
        .bind(stat.unique_tracks)
        .bind(stat.computed_at)
        .fetch_optional(&self.pool)
        .await?;

        // RETURNING yields no row when the conflict clause skipped the insert
        match inserted {
            Some(stat) => Ok(WeeklyStatInsert::Inserted(stat)),
            None => self
                .get_weekly_stat(stat.linked_account_id, &stat.week_identifier)
                .await?
                .map(WeeklyStatInsert::Existing)
                .ok_or_else(|| {
                    crate::error::StoreError::NotFound(format!(
                        "weekly stat {} for {}",
                        stat.week_identifier, stat.linked_account_id
                    ))
                }),
        }
    }

    async fn get_slack_workspace(
        &self,
        slack_workspace_id: &str,
    ) -> StoreResult<Option<SlackWorkspace>> {
        let workspace = sqlx::query_as::<_, SlackWorkspace>(
            "SELECT * FROM slack_workspaces WHERE slack_workspace_id = $1",
        )
        .bind(slack_workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(workspace)
    }

    async fn list_leaderboard_workspaces(&self) -> StoreResult<Vec<SlackWorkspace>> {
        let workspaces = sqlx::query_as::<_, SlackWorkspace>(
            r#"
            SELECT * FROM slack_workspaces
            WHERE stats_enabled AND stats_channel_id IS NOT NULL AND stats_channel_id <> ''
            ORDER BY slack_workspace_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(workspaces)
    }
}

// These need a Postgres server: DATABASE_URL=... cargo test -- --ignored
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::stats::{AggregateOutcome, WeeklyAggregator};
    use crate::testing::{artist, play, utc};
    use crate::week::week_window;
    use chrono::Duration;
    use std::sync::Arc;

    async fn account(store: &PgStore, spotify_user_id: &str) -> LinkedAccount {
        store
            .upsert_linked_account(spotify_user_id, "access", "refresh", Utc::now(), None)
            .await
            .unwrap()
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_credentials_keep_unrotated_refresh_token(pool: PgPool) {
        let store = PgStore::new(pool);
        let account = account(&store, "spotify_credentials").await;

        store
            .update_credentials(account.id, "new_access", None, Utc::now() + Duration::hours(2))
            .await
            .unwrap();

        let updated = store.get_linked_account(account.id).await.unwrap().unwrap();
        assert_eq!(updated.access_token, "new_access");
        assert_eq!(updated.refresh_token, "refresh");
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_commit_ingestion_is_idempotent(pool: PgPool) {
        let store = PgStore::new(pool);
        let account = account(&store, "spotify_ingest").await;
        let at = utc(2025, 6, 4, 12, 0);
        let events = vec![
            play("t1", vec![artist("a1"), artist("a2")], 180_000, at),
            play("t2", vec![artist("a1")], 180_000, at),
        ];

        let first = store.commit_ingestion(account.id, &events, at, at).await.unwrap();
        let second = store.commit_ingestion(account.id, &events, at, at).await.unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 0);

        let plays = store.plays_between(account.id, at, at).await.unwrap();
        assert_eq!(plays.len(), 2);
        let t1 = plays.iter().find(|p| p.track_id == "t1").unwrap();
        assert_eq!(t1.artists.len(), 2);

        let cursor = store.get_cursor(account.id).await.unwrap().unwrap();
        assert_eq!(cursor.last_fetched_at, Some(at));
        assert_eq!(cursor.tracks_fetched_in_last_run, 0);
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_weekly_stat_insert_reports_existing_row(pool: PgPool) {
        let store = PgStore::new(pool);
        let account = account(&store, "spotify_stats").await;
        let mut stat = NewWeeklyStat {
            linked_account_id: account.id,
            week_identifier: "2025-W23".to_string(),
            week_start: utc(2025, 6, 2, 0, 0),
            week_end: utc(2025, 6, 8, 23, 59),
            top_tracks: vec![],
            top_artists: vec![],
            total_minutes: 42,
            total_plays: 14,
            unique_tracks: 9,
            computed_at: utc(2025, 6, 9, 0, 15),
        };

        let first = store.insert_weekly_stat_if_absent(&stat).await.unwrap();
        stat.total_minutes = 99;
        let second = store.insert_weekly_stat_if_absent(&stat).await.unwrap();

        assert!(matches!(first, WeeklyStatInsert::Inserted(_)));
        assert!(matches!(second, WeeklyStatInsert::Existing(_)));
        assert_eq!(first.stat().id, second.stat().id);
        assert_eq!(second.stat().total_minutes, 42);
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_aggregate_with_system_clock_reports_created(pool: PgPool) {
        let store = Arc::new(PgStore::new(pool));
        let account = account(&store, "spotify_aggregate").await;
        let week = week_window(Utc::now(), Duration::hours(1));
        let at = week.start + Duration::hours(1);
        store
            .commit_ingestion(
                account.id,
                &[play("t1", vec![artist("a1")], 180_000, at)],
                at,
                at,
            )
            .await
            .unwrap();

        // Nanosecond clock readings must not be mistaken for a concurrent run
        let aggregator = WeeklyAggregator::new(store.clone(), Arc::new(SystemClock));

        let first = aggregator.aggregate(account.id, &week).await.unwrap();
        assert!(matches!(first, AggregateOutcome::Created(_)), "got {:?}", first);

        let second = aggregator.aggregate(account.id, &week).await.unwrap();
        assert!(matches!(second, AggregateOutcome::AlreadyComputed(_)));
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_remove_associations_keeps_account(pool: PgPool) {
        let store = PgStore::new(pool);
        let account = account(&store, "spotify_revoke").await;
        let a = store
            .upsert_association(account.id, "T1", "U1", "One")
            .await
            .unwrap();
        let b = store
            .upsert_association(account.id, "T2", "U1", "Two")
            .await
            .unwrap();

        let removed = store.remove_associations(account.id, &[a.id, b.id]).await.unwrap();

        assert_eq!(removed, 2);
        assert!(store.list_associations(account.id).await.unwrap().is_empty());
        assert!(store.get_linked_account(account.id).await.unwrap().is_some());
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_reinstall_keeps_leaderboard_settings(pool: PgPool) {
        let store = PgStore::new(pool);
        store.upsert_slack_workspace("T1", "xoxb-old").await.unwrap();
        store.upsert_slack_workspace("T2", "xoxb-2").await.unwrap();
        store.set_stats_channel("T1", Some("C1"), true).await.unwrap();

        store.upsert_slack_workspace("T1", "xoxb-new").await.unwrap();

        let workspace = store.get_slack_workspace("T1").await.unwrap().unwrap();
        assert_eq!(workspace.bot_token, "xoxb-new");
        assert_eq!(workspace.leaderboard_channel(), Some("C1"));

        let listed = store.list_leaderboard_workspaces().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].slack_workspace_id, "T1");
    }
}
