use crate::clock::Clock;
use crate::db::Store;
use crate::db::models::{LinkedAccount, NewPlayEvent};
use crate::error::{IngestError, TokenError};
use crate::ingest::cursor::{cursor_for, next_position};
use crate::revocation::{RevocationCascade, RevocationReport};
use crate::spotify::{SpotifyApi, TokenManager};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// No Slack workspace links the account any more.
    SkippedNoAssociations,
    Revoked(RevocationReport),
    /// Spotify returned an empty page; the cursor was left alone.
    NoNewPlays,
    Stored { fetched: usize, inserted: u64 },
}

/// Pulls one page of recently played tracks per run and stores the unseen ones.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
    spotify: Arc<dyn SpotifyApi>,
    tokens: TokenManager,
    revocation: RevocationCascade,
    clock: Arc<dyn Clock>,
    page_size: u32,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn Store>,
        spotify: Arc<dyn SpotifyApi>,
        tokens: TokenManager,
        revocation: RevocationCascade,
        clock: Arc<dyn Clock>,
        page_size: u32,
    ) -> Self {
        Self {
            store,
            spotify,
            tokens,
            revocation,
            clock,
            page_size,
        }
    }

    /// Run one ingestion pass for an account.
    ///
    /// Safe to repeat: nothing is written unless the fetch succeeded, and the
    /// new plays and the advanced cursor land in a single commit.
    ///
    /// # Errors
    /// - `IngestError::Transient` on a failed refresh or fetch; the cursor is untouched
    /// - `IngestError::Store` if the store could not be read or written
    pub async fn run_once(&self, account: &LinkedAccount) -> Result<IngestOutcome, IngestError> {
        let associations = self.store.list_associations(account.id).await?;
        if associations.is_empty() {
            tracing::debug!(
                linked_account_id = %account.id,
                "No workspace associations, skipping ingestion"
            );
            return Ok(IngestOutcome::SkippedNoAssociations);
        }

        let access_token = match self.tokens.ensure_valid_access_token(account).await {
            Ok(token) => token,
            Err(TokenError::Revoked(_)) => {
                let report = self.revocation.handle_revocation(account).await?;
                return Ok(IngestOutcome::Revoked(report));
            }
            Err(TokenError::Transient(e)) => return Err(IngestError::Transient(e)),
            Err(TokenError::Store(e)) => return Err(IngestError::Store(e)),
        };

        let params = cursor_for(self.store.as_ref(), account.id, self.page_size).await?;

        let page = self
            .spotify
            .fetch_recent_plays(&access_token, params.after, params.limit)
            .await
            .map_err(|e| {
                tracing::warn!(
                    linked_account_id = %account.id,
                    after = ?params.after,
                    error = %e,
                    "Failed to fetch recently played tracks"
                );
                IngestError::Transient(e)
            })?;

        let Some(position) = next_position(&page) else {
            tracing::debug!(
                linked_account_id = %account.id,
                after = ?params.after,
                "No new plays, cursor unchanged"
            );
            return Ok(IngestOutcome::NoNewPlays);
        };

        let fetched = page.fetched_count();
        let candidates = self.unseen_plays(account, page.items).await?;

        let inserted = self
            .store
            .commit_ingestion(account.id, &candidates, position, self.clock.now())
            .await?;

        tracing::info!(
            linked_account_id = %account.id,
            fetched,
            inserted,
            last_fetched_at = %position,
            "Stored recently played tracks"
        );

        Ok(IngestOutcome::Stored { fetched, inserted })
    }

    /// Drop candidates already stored, looking only at the page's own
    /// time range and track ids. Repeats within the page collapse too.
    async fn unseen_plays(
        &self,
        account: &LinkedAccount,
        items: Vec<NewPlayEvent>,
    ) -> Result<Vec<NewPlayEvent>, IngestError> {
        let (Some(from), Some(to)) = (
            items.iter().map(|i| i.played_at).min(),
            items.iter().map(|i| i.played_at).max(),
        ) else {
            return Ok(Vec::new());
        };

        let track_ids: Vec<String> = items
            .iter()
            .map(|i| i.track_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut seen = self
            .store
            .existing_play_keys(account.id, &track_ids, from, to)
            .await?;
        let existing = seen.len();

        let unseen: Vec<NewPlayEvent> = items
            .into_iter()
            .filter(|item| seen.insert(item.dedup_key()))
            .collect();

        tracing::debug!(
            linked_account_id = %account.id,
            existing,
            unseen = unseen.len(),
            "Deduplicated fetched plays"
        );

        Ok(unseen)
    }
}
