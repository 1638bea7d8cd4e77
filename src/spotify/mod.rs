pub mod client;
pub mod models;
pub mod token;

use crate::db::models::{NewPlayEvent, RefreshStrategy};
use crate::error::SpotifyError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

pub use client::SpotifyClient;
pub use token::TokenManager;

/// One page of recently played tracks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecentPlaysPage {
    pub items: Vec<NewPlayEvent>,
    /// Spotify's `cursors.after`, milliseconds since the epoch as a string.
    pub next_cursor: Option<String>,
    /// `played_at` of items that were fetched but cannot be stored (local
    /// files). They still move the cursor.
    pub skipped_played_at: Vec<DateTime<Utc>>,
}

impl RecentPlaysPage {
    /// Number of items Spotify actually returned.
    pub fn fetched_count(&self) -> usize {
        self.items.len() + self.skipped_played_at.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_in: Duration,
    /// Only present when Spotify rotated the refresh token.
    pub refresh_token: Option<String>,
}

/// The two upstream calls the pipeline makes.
#[async_trait]
pub trait SpotifyApi: Send + Sync {
    async fn fetch_recent_plays(
        &self,
        access_token: &str,
        after: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<RecentPlaysPage, SpotifyError>;

    async fn refresh_token(
        &self,
        refresh_token: &str,
        strategy: &RefreshStrategy,
    ) -> Result<RefreshedToken, SpotifyError>;
}
