use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A Spotify account and the credentials used to read its history.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct LinkedAccount {
    pub id: Uuid,
    pub spotify_user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// Set when the account was linked through a client-bound (PKCE) flow.
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a linked account's refresh token is exchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshStrategy {
    /// Uses the account's own client id, no secret.
    ClientBound { client_id: String },
    /// Uses the service-wide client id/secret pair.
    SharedSecret,
}

impl LinkedAccount {
    pub fn refresh_strategy(&self) -> RefreshStrategy {
        match self.client_id.as_deref() {
            Some(client_id) if !client_id.is_empty() => RefreshStrategy::ClientBound {
                client_id: client_id.to_string(),
            },
            _ => RefreshStrategy::SharedSecret,
        }
    }
}

/// A Slack user in a Slack workspace tracking a linked account.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Association {
    pub id: Uuid,
    pub linked_account_id: Uuid,
    pub slack_workspace_id: String,
    pub slack_user_id: String,
    pub workspace_name: String,
    pub connected_at: DateTime<Utc>,
}

/// A Slack workspace the bot is installed in.
///
/// Bot tokens only work inside their own workspace, so every message is sent
/// with the token of the workspace it goes to.
#[derive(Debug, Clone, FromRow, PartialEq)]
pub struct SlackWorkspace {
    pub slack_workspace_id: String,
    pub bot_token: String,
    /// Where the weekly leaderboard is posted. `None` disables the post.
    pub stats_channel_id: Option<String>,
    pub stats_enabled: bool,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SlackWorkspace {
    /// The channel to post the weekly leaderboard to, if posting is on.
    pub fn leaderboard_channel(&self) -> Option<&str> {
        self.stats_channel_id
            .as_deref()
            .filter(|channel| self.stats_enabled && !channel.is_empty())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct IngestionCursor {
    pub linked_account_id: Uuid,
    /// Lower bound for the next fetch. `None` until a fetch returned something.
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub tracks_fetched_in_last_run: i32,
    pub last_run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ArtistCredit {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct PlayEvent {
    pub id: Uuid,
    pub linked_account_id: Uuid,
    pub track_id: String,
    pub track_name: String,
    #[sqlx(json)]
    pub artists: Vec<ArtistCredit>,
    pub album_name: String,
    pub duration_ms: i32,
    pub played_at: DateTime<Utc>,
    pub context_type: Option<String>,
    pub context_uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A play event that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPlayEvent {
    pub track_id: String,
    pub track_name: String,
    pub artists: Vec<ArtistCredit>,
    pub album_name: String,
    pub duration_ms: i32,
    pub played_at: DateTime<Utc>,
    pub context_type: Option<String>,
    pub context_uri: Option<String>,
}

impl NewPlayEvent {
    pub fn dedup_key(&self) -> (String, DateTime<Utc>) {
        (self.track_id.clone(), self.played_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopTrack {
    pub id: String,
    pub name: String,
    pub artist_display: String,
    pub play_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopArtist {
    pub id: String,
    pub name: String,
    pub play_count: i32,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct WeeklyStat {
    pub id: Uuid,
    pub linked_account_id: Uuid,
    pub week_identifier: String,
    pub week_start: DateTime<Utc>,
    pub week_end: DateTime<Utc>,
    #[sqlx(json)]
    pub top_tracks: Vec<TopTrack>,
    #[sqlx(json)]
    pub top_artists: Vec<TopArtist>,
    pub total_minutes: i32,
    pub total_plays: i32,
    pub unique_tracks: i32,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWeeklyStat {
    pub linked_account_id: Uuid,
    pub week_identifier: String,
    pub week_start: DateTime<Utc>,
    pub week_end: DateTime<Utc>,
    pub top_tracks: Vec<TopTrack>,
    pub top_artists: Vec<TopArtist>,
    pub total_minutes: i32,
    pub total_plays: i32,
    pub unique_tracks: i32,
    pub computed_at: DateTime<Utc>,
}
