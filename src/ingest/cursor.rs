use crate::db::{Store, StoreResult};
use crate::spotify::RecentPlaysPage;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Parameters for one recently-played fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchParams {
    /// Lower bound; `None` on an account's first run.
    pub after: Option<DateTime<Utc>>,
    pub limit: u32,
}

/// Where the next fetch for this account should start.
pub async fn cursor_for(
    store: &dyn Store,
    linked_account_id: Uuid,
    limit: u32,
) -> StoreResult<FetchParams> {
    let after = store
        .get_cursor(linked_account_id)
        .await?
        .and_then(|cursor| cursor.last_fetched_at);

    Ok(FetchParams { after, limit })
}

/// Decode an upstream pagination cursor.
///
/// Spotify sends milliseconds since the epoch; RFC 3339 is accepted too.
pub fn decode_cursor(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<i64>() {
        return DateTime::from_timestamp_millis(millis);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// The position a successful fetch advances the cursor to.
///
/// `None` when Spotify returned nothing at all: the cursor stays where it is.
/// Items skipped as unstorable still count. Otherwise the upstream cursor
/// wins, falling back to the newest `played_at`.
pub fn next_position(page: &RecentPlaysPage) -> Option<DateTime<Utc>> {
    let newest = page
        .items
        .iter()
        .map(|item| item.played_at)
        .chain(page.skipped_played_at.iter().copied())
        .max()?;

    if let Some(raw) = page.next_cursor.as_deref() {
        match decode_cursor(raw) {
            Some(position) => return Some(position),
            None => tracing::warn!(
                cursor = raw,
                "Undecodable pagination cursor, falling back to latest played_at"
            ),
        }
    }

    Some(newest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::db::models::IngestionCursor;
    use crate::testing::{artist, play, utc};

    #[test]
    fn test_decode_millis_cursor() {
        assert_eq!(
            decode_cursor("1748736600000"),
            Some(utc(2025, 6, 1, 0, 10))
        );
    }

    #[test]
    fn test_decode_rfc3339_cursor() {
        assert_eq!(
            decode_cursor("2025-06-01T00:10:00Z"),
            Some(utc(2025, 6, 1, 0, 10))
        );
    }

    #[test]
    fn test_decode_garbage_cursor() {
        assert_eq!(decode_cursor("tomorrow"), None);
    }

    #[test]
    fn test_empty_page_does_not_advance() {
        let page = RecentPlaysPage {
            items: vec![],
            next_cursor: Some("1748736600000".to_string()),
            ..Default::default()
        };
        assert_eq!(next_position(&page), None);
    }

    #[test]
    fn test_upstream_cursor_preferred_over_latest_play() {
        let page = RecentPlaysPage {
            items: vec![
                play("t1", vec![artist("a1")], 180_000, utc(2025, 6, 1, 0, 2)),
                play("t2", vec![artist("a1")], 180_000, utc(2025, 6, 1, 0, 5)),
            ],
            next_cursor: Some("1748736600000".to_string()),
            ..Default::default()
        };
        assert_eq!(next_position(&page), Some(utc(2025, 6, 1, 0, 10)));
    }

    #[test]
    fn test_latest_play_used_without_cursor() {
        let page = RecentPlaysPage {
            items: vec![
                play("t2", vec![artist("a1")], 180_000, utc(2025, 6, 1, 0, 5)),
                play("t1", vec![artist("a1")], 180_000, utc(2025, 6, 1, 0, 2)),
            ],
            next_cursor: None,
            ..Default::default()
        };
        assert_eq!(next_position(&page), Some(utc(2025, 6, 1, 0, 5)));
    }

    #[test]
    fn test_latest_play_used_when_cursor_undecodable() {
        let page = RecentPlaysPage {
            items: vec![play("t1", vec![artist("a1")], 180_000, utc(2025, 6, 1, 0, 2))],
            next_cursor: Some("??".to_string()),
            ..Default::default()
        };
        assert_eq!(next_position(&page), Some(utc(2025, 6, 1, 0, 2)));
    }

    #[test]
    fn test_page_of_local_files_still_advances() {
        let page = RecentPlaysPage {
            items: vec![],
            next_cursor: Some("1748739000000".to_string()),
            skipped_played_at: vec![utc(2025, 6, 1, 0, 40), utc(2025, 6, 1, 0, 45)],
        };
        assert_eq!(next_position(&page), Some(utc(2025, 6, 1, 0, 50)));
    }

    #[test]
    fn test_local_files_count_toward_latest_play() {
        let page = RecentPlaysPage {
            items: vec![play("t1", vec![artist("a1")], 180_000, utc(2025, 6, 1, 0, 2))],
            next_cursor: None,
            skipped_played_at: vec![utc(2025, 6, 1, 0, 7)],
        };
        assert_eq!(next_position(&page), Some(utc(2025, 6, 1, 0, 7)));
    }

    #[tokio::test]
    async fn test_first_run_has_no_lower_bound() {
        let store = MemoryStore::new();
        let params = cursor_for(&store, Uuid::new_v4(), 50).await.unwrap();
        assert_eq!(
            params,
            FetchParams {
                after: None,
                limit: 50
            }
        );
    }

    #[tokio::test]
    async fn test_later_runs_start_at_last_fetched() {
        let store = MemoryStore::new();
        let account_id = Uuid::new_v4();
        store.set_cursor(IngestionCursor {
            linked_account_id: account_id,
            last_fetched_at: Some(utc(2025, 6, 1, 0, 0)),
            tracks_fetched_in_last_run: 3,
            last_run_at: utc(2025, 6, 1, 0, 20),
        });

        let params = cursor_for(&store, account_id, 20).await.unwrap();
        assert_eq!(params.after, Some(utc(2025, 6, 1, 0, 0)));
        assert_eq!(params.limit, 20);
    }
}
