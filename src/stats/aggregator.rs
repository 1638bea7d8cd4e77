use crate::clock::Clock;
use crate::db::{Store, WeeklyStatInsert};
use crate::db::models::{NewWeeklyStat, PlayEvent, TopArtist, TopTrack, WeeklyStat};
use crate::error::StoreError;
use crate::week::WeekWindow;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// How many tracks and artists a ranking keeps.
pub const TOP_N: usize = 5;

/// Totals and rankings over a set of plays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListeningSummary {
    pub top_tracks: Vec<TopTrack>,
    pub top_artists: Vec<TopArtist>,
    pub total_minutes: i32,
    pub total_plays: i32,
    pub unique_tracks: i32,
}

impl From<&WeeklyStat> for ListeningSummary {
    fn from(stat: &WeeklyStat) -> Self {
        Self {
            top_tracks: stat.top_tracks.clone(),
            top_artists: stat.top_artists.clone(),
            total_minutes: stat.total_minutes,
            total_plays: stat.total_plays,
            unique_tracks: stat.unique_tracks,
        }
    }
}

/// Rank plays by track and by artist and total them up.
///
/// Rankings sort by play count, highest first; equal counts keep the order in
/// which the track or artist first appears in `plays`. Every credited artist
/// gets a full count for the play. Minutes are truncated, not rounded.
pub fn compute_stats(plays: &[PlayEvent], top_n: usize) -> ListeningSummary {
    let mut tracks: Vec<TopTrack> = Vec::new();
    let mut track_index: HashMap<&str, usize> = HashMap::new();
    let mut artists: Vec<TopArtist> = Vec::new();
    let mut artist_index: HashMap<&str, usize> = HashMap::new();
    let mut total_ms: i64 = 0;

    for play in plays {
        total_ms += i64::from(play.duration_ms);

        match track_index.get(play.track_id.as_str()) {
            Some(&i) => tracks[i].play_count += 1,
            None => {
                track_index.insert(play.track_id.as_str(), tracks.len());
                tracks.push(TopTrack {
                    id: play.track_id.clone(),
                    name: play.track_name.clone(),
                    artist_display: play
                        .artists
                        .iter()
                        .map(|a| a.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                    play_count: 1,
                });
            }
        }

        for credit in &play.artists {
            match artist_index.get(credit.id.as_str()) {
                Some(&i) => artists[i].play_count += 1,
                None => {
                    artist_index.insert(credit.id.as_str(), artists.len());
                    artists.push(TopArtist {
                        id: credit.id.clone(),
                        name: credit.name.clone(),
                        play_count: 1,
                    });
                }
            }
        }
    }

    let unique_tracks = tracks.len() as i32;

    // sort_by is stable
    tracks.sort_by(|a, b| b.play_count.cmp(&a.play_count));
    tracks.truncate(top_n);
    artists.sort_by(|a, b| b.play_count.cmp(&a.play_count));
    artists.truncate(top_n);

    ListeningSummary {
        top_tracks: tracks,
        top_artists: artists,
        total_minutes: (total_ms / 60_000) as i32,
        total_plays: plays.len() as i32,
        unique_tracks,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutcome {
    Created(WeeklyStat),
    /// A stat for this week already existed and was left as is.
    AlreadyComputed(WeeklyStat),
    NoPlays,
}

/// Freezes one week of listening into a permanent [`WeeklyStat`].
#[derive(Clone)]
pub struct WeeklyAggregator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl WeeklyAggregator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Compute the stat for `week` unless one already exists.
    ///
    /// # Errors
    /// Returns `StoreError` if the store could not be read or written
    pub async fn aggregate(
        &self,
        linked_account_id: Uuid,
        week: &WeekWindow,
    ) -> Result<AggregateOutcome, StoreError> {
        if let Some(existing) = self
            .store
            .get_weekly_stat(linked_account_id, &week.identifier)
            .await?
        {
            tracing::debug!(
                linked_account_id = %linked_account_id,
                week_identifier = %week.identifier,
                "Weekly stats already computed, skipping"
            );
            return Ok(AggregateOutcome::AlreadyComputed(existing));
        }

        let plays = self
            .store
            .plays_between(linked_account_id, week.start, week.end)
            .await?;

        if plays.is_empty() {
            tracing::debug!(
                linked_account_id = %linked_account_id,
                week_identifier = %week.identifier,
                "No plays in week, nothing to aggregate"
            );
            return Ok(AggregateOutcome::NoPlays);
        }

        let summary = compute_stats(&plays, TOP_N);

        let new_stat = NewWeeklyStat {
            linked_account_id,
            week_identifier: week.identifier.clone(),
            week_start: week.start,
            week_end: week.end,
            top_tracks: summary.top_tracks,
            top_artists: summary.top_artists,
            total_minutes: summary.total_minutes,
            total_plays: summary.total_plays,
            unique_tracks: summary.unique_tracks,
            computed_at: self.clock.now(),
        };

        let stored = match self.store.insert_weekly_stat_if_absent(&new_stat).await? {
            WeeklyStatInsert::Inserted(stored) => stored,
            WeeklyStatInsert::Existing(existing) => {
                tracing::debug!(
                    linked_account_id = %linked_account_id,
                    week_identifier = %week.identifier,
                    "Weekly stats stored by a concurrent run"
                );
                return Ok(AggregateOutcome::AlreadyComputed(existing));
            }
        };

        tracing::info!(
            linked_account_id = %linked_account_id,
            week_identifier = %week.identifier,
            total_plays = stored.total_plays,
            total_minutes = stored.total_minutes,
            unique_tracks = stored.unique_tracks,
            "Weekly stats computed"
        );

        Ok(AggregateOutcome::Created(stored))
    }
}
