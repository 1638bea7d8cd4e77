use crate::db::models::{ArtistCredit, NewPlayEvent};
use crate::spotify::RecentPlaysPage;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Spotify API response for `GET /me/player/recently-played`
#[derive(Debug, Deserialize)]
pub struct RecentlyPlayedResponse {
    pub items: Vec<PlayHistoryItem>,
    #[serde(default)]
    pub cursors: Option<Cursors>,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Cursors {
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlayHistoryItem {
    pub track: TrackObject,
    pub played_at: DateTime<Utc>,
    #[serde(default)]
    pub context: Option<ContextObject>,
}

#[derive(Debug, Deserialize)]
pub struct TrackObject {
    /// Null for local files
    pub id: Option<String>,
    pub name: String,
    pub duration_ms: i32,
    pub artists: Vec<ArtistObject>,
    pub album: AlbumObject,
}

#[derive(Debug, Deserialize)]
pub struct ArtistObject {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AlbumObject {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ContextObject {
    #[serde(rename = "type")]
    pub context_type: String,
    pub uri: String,
}

impl RecentlyPlayedResponse {
    /// Keep the items that can be stored and the `after` cursor.
    pub fn into_page(self) -> RecentPlaysPage {
        let mut items = Vec::with_capacity(self.items.len());
        let mut skipped_played_at = Vec::new();

        for item in self.items {
            let Some(track_id) = item.track.id else {
                skipped_played_at.push(item.played_at);
                continue;
            };
            items.push(NewPlayEvent {
                track_id,
                track_name: item.track.name,
                artists: item
                    .track
                    .artists
                    .into_iter()
                    .filter_map(|a| Some(ArtistCredit { id: a.id?, name: a.name }))
                    .collect(),
                album_name: item.track.album.name,
                duration_ms: item.track.duration_ms,
                played_at: item.played_at,
                context_type: item.context.as_ref().map(|c| c.context_type.clone()),
                context_uri: item.context.map(|c| c.uri),
            });
        }

        if !skipped_played_at.is_empty() {
            tracing::debug!(
                skipped = skipped_played_at.len(),
                "Skipped recently played items without a track id"
            );
        }

        RecentPlaysPage {
            items,
            next_cursor: self.cursors.and_then(|c| c.after),
            skipped_played_at,
        }
    }
}
