pub mod memory;
pub mod models;
pub mod repository;

use crate::db::models::{
    Association, IngestionCursor, LinkedAccount, NewPlayEvent, NewWeeklyStat, PlayEvent,
    SlackWorkspace, WeeklyStat,
};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::collections::HashSet;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use repository::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence contract for the ingestion and aggregation pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_linked_accounts(&self) -> StoreResult<Vec<LinkedAccount>>;

    async fn get_linked_account(&self, id: Uuid) -> StoreResult<Option<LinkedAccount>>;

    /// Overwrite the access token and expiry. The refresh token is only
    /// replaced when `refresh_token` is `Some`.
    async fn update_credentials(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn list_associations(&self, linked_account_id: Uuid) -> StoreResult<Vec<Association>>;

    async fn list_workspace_associations(
        &self,
        slack_workspace_id: &str,
    ) -> StoreResult<Vec<Association>>;

    /// Delete the given associations and the account's cursor in one transaction.
    async fn remove_associations(
        &self,
        linked_account_id: Uuid,
        association_ids: &[Uuid],
    ) -> StoreResult<u64>;

    async fn get_cursor(&self, linked_account_id: Uuid) -> StoreResult<Option<IngestionCursor>>;

    /// `(track_id, played_at)` pairs already stored for the account, limited to
    /// `track_ids` and the inclusive `[from, to]` range.
    async fn existing_play_keys(
        &self,
        linked_account_id: Uuid,
        track_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<HashSet<(String, DateTime<Utc>)>>;

    /// Store `events` and move the cursor to `last_fetched_at` atomically.
    ///
    /// Events colliding with an already stored `(track_id, played_at)` are
    /// skipped. Returns the number of events actually inserted, which is also
    /// recorded as the cursor's `tracks_fetched_in_last_run`.
    async fn commit_ingestion(
        &self,
        linked_account_id: Uuid,
        events: &[NewPlayEvent],
        last_fetched_at: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Plays in the inclusive `[from, to]` range, oldest first.
    async fn plays_between(
        &self,
        linked_account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<PlayEvent>>;

    async fn has_plays_before(
        &self,
        linked_account_id: Uuid,
        before: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn get_weekly_stat(
        &self,
        linked_account_id: Uuid,
        week_identifier: &str,
    ) -> StoreResult<Option<WeeklyStat>>;

    /// Insert unless a stat for the same account and week exists.
    async fn insert_weekly_stat_if_absent(
        &self,
        stat: &NewWeeklyStat,
    ) -> StoreResult<WeeklyStatInsert>;

    async fn get_slack_workspace(
        &self,
        slack_workspace_id: &str,
    ) -> StoreResult<Option<SlackWorkspace>>;

    /// Workspaces with the weekly leaderboard enabled and a channel set.
    async fn list_leaderboard_workspaces(&self) -> StoreResult<Vec<SlackWorkspace>>;
}

/// Which row `insert_weekly_stat_if_absent` left in place.
#[derive(Debug, Clone, PartialEq)]
pub enum WeeklyStatInsert {
    Inserted(WeeklyStat),
    /// Another run stored this week first; its row is untouched.
    Existing(WeeklyStat),
}

impl WeeklyStatInsert {
    pub fn stat(&self) -> &WeeklyStat {
        match self {
            WeeklyStatInsert::Inserted(stat) | WeeklyStatInsert::Existing(stat) => stat,
        }
    }

    pub fn into_stat(self) -> WeeklyStat {
        match self {
            WeeklyStatInsert::Inserted(stat) | WeeklyStatInsert::Existing(stat) => stat,
        }
    }
}

pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    tracing::info!("Initializing database connection pool");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    tracing::info!("Database connection pool initialized successfully");

    Ok(pool)
}
