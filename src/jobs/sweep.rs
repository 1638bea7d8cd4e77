use crate::clock::Clock;
use crate::db::Store;
use crate::db::models::LinkedAccount;
use crate::error::StoreError;
use crate::ingest::{IngestOutcome, Ingestor};
use crate::stats::{AggregateOutcome, WeeklyAggregator};
use crate::week::week_window;
use chrono::Duration;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Per-sweep tally, logged at the end of every sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub accounts: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub revoked: usize,
    pub failed: usize,
    /// Accounts never started because shutdown was requested.
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountResult {
    Succeeded,
    Skipped,
    Revoked,
    Failed,
    Cancelled,
}

impl SweepSummary {
    fn tally(results: &[AccountResult]) -> Self {
        let mut summary = SweepSummary {
            accounts: results.len(),
            ..Default::default()
        };
        for result in results {
            match result {
                AccountResult::Succeeded => summary.succeeded += 1,
                AccountResult::Skipped => summary.skipped += 1,
                AccountResult::Revoked => summary.revoked += 1,
                AccountResult::Failed => summary.failed += 1,
                AccountResult::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }
}

/// Runs the pipeline over every linked account through a bounded worker pool.
pub struct Sweeper {
    store: Arc<dyn Store>,
    ingestor: Ingestor,
    aggregator: WeeklyAggregator,
    clock: Arc<dyn Clock>,
    grace: Duration,
    concurrency: usize,
    // Held for a whole sweep so no account is processed by two sweeps at once
    running: Mutex<()>,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn Store>,
        ingestor: Ingestor,
        aggregator: WeeklyAggregator,
        clock: Arc<dyn Clock>,
        grace: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            ingestor,
            aggregator,
            clock,
            grace,
            concurrency: concurrency.max(1),
            running: Mutex::new(()),
        }
    }

    /// One ingestion pass over all linked accounts.
    ///
    /// A failing account is logged and counted; it never stops the others.
    /// Cancellation is checked before each account starts.
    ///
    /// # Errors
    /// Returns `StoreError` only if the account list itself cannot be loaded
    pub async fn run_ingestion_sweep(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SweepSummary, StoreError> {
        let _running = self.running.lock().await;
        let accounts = self.store.list_linked_accounts().await?;

        tracing::info!(accounts = accounts.len(), "Starting ingestion sweep");

        let results = futures::stream::iter(accounts)
            .map(|account| async move {
                if cancel.is_cancelled() {
                    return AccountResult::Cancelled;
                }
                self.ingest_account(&account).await
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let summary = SweepSummary::tally(&results);
        tracing::info!(
            accounts = summary.accounts,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            revoked = summary.revoked,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Ingestion sweep complete"
        );

        Ok(summary)
    }

    async fn ingest_account(&self, account: &LinkedAccount) -> AccountResult {
        match self.ingestor.run_once(account).await {
            Ok(IngestOutcome::Stored { .. }) | Ok(IngestOutcome::NoNewPlays) => {
                AccountResult::Succeeded
            }
            Ok(IngestOutcome::SkippedNoAssociations) => AccountResult::Skipped,
            Ok(IngestOutcome::Revoked(_)) => AccountResult::Revoked,
            Err(e) => {
                tracing::warn!(
                    linked_account_id = %account.id,
                    error = %e,
                    "Ingestion failed for account, will retry next run"
                );
                AccountResult::Failed
            }
        }
    }

    /// Freeze the most recently completed week for every linked account.
    ///
    /// # Errors
    /// Returns `StoreError` only if the account list itself cannot be loaded
    pub async fn run_weekly_aggregation_sweep(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SweepSummary, StoreError> {
        let _running = self.running.lock().await;
        let week = week_window(self.clock.now(), self.grace);
        let accounts = self.store.list_linked_accounts().await?;

        tracing::info!(
            accounts = accounts.len(),
            week_identifier = %week.identifier,
            week_start = %week.start,
            week_end = %week.end,
            "Starting weekly aggregation sweep"
        );

        let week = &week;
        let results = futures::stream::iter(accounts)
            .map(|account| async move {
                if cancel.is_cancelled() {
                    return AccountResult::Cancelled;
                }
                match self.aggregator.aggregate(account.id, week).await {
                    Ok(AggregateOutcome::Created(_)) => AccountResult::Succeeded,
                    Ok(AggregateOutcome::AlreadyComputed(_)) | Ok(AggregateOutcome::NoPlays) => {
                        AccountResult::Skipped
                    }
                    Err(e) => {
                        tracing::error!(
                            linked_account_id = %account.id,
                            week_identifier = %week.identifier,
                            error = ?e,
                            "Weekly aggregation failed for account"
                        );
                        AccountResult::Failed
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let summary = SweepSummary::tally(&results);
        tracing::info!(
            week_identifier = %week.identifier,
            accounts = summary.accounts,
            computed = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Weekly aggregation sweep complete"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::MemoryStore;
    use crate::error::SpotifyError;
    use crate::revocation::RevocationCascade;
    use crate::spotify::{RecentPlaysPage, TokenManager};
    use crate::testing::{FakeSpotify, RecordingNotifier, artist, linked_account, play, utc};

    struct Harness {
        store: Arc<MemoryStore>,
        spotify: Arc<FakeSpotify>,
        sweeper: Sweeper,
    }

    fn harness(now: chrono::DateTime<chrono::Utc>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let spotify = Arc::new(FakeSpotify::new());
        let clock = Arc::new(FixedClock::new(now));
        let tokens = TokenManager::new(
            store.clone(),
            spotify.clone(),
            clock.clone(),
            Duration::minutes(1),
        );
        let revocation = RevocationCascade::new(store.clone(), Arc::new(RecordingNotifier::new()));
        let ingestor = Ingestor::new(
            store.clone(),
            spotify.clone(),
            tokens,
            revocation,
            clock.clone(),
            50,
        );
        let aggregator = WeeklyAggregator::new(store.clone(), clock.clone());
        // One worker keeps the scripted pages in account order
        let sweeper = Sweeper::new(
            store.clone(),
            ingestor,
            aggregator,
            clock,
            Duration::hours(1),
            1,
        );
        Harness {
            store,
            spotify,
            sweeper,
        }
    }

    fn add_account(h: &Harness, expires_at: chrono::DateTime<chrono::Utc>, linked: bool) -> LinkedAccount {
        let account = linked_account(expires_at);
        h.store.insert_linked_account(account.clone());
        if linked {
            h.store
                .add_association(account.id, "T1", &format!("U-{}", account.id), "Music Club");
        }
        account
    }

    #[tokio::test]
    async fn test_failing_account_does_not_stop_sweep() {
        let h = harness(utc(2025, 6, 4, 12, 0));
        let healthy = add_account(&h, utc(2025, 6, 4, 13, 0), true);
        let unlinked = add_account(&h, utc(2025, 6, 4, 13, 0), false);
        let expired = add_account(&h, utc(2025, 6, 4, 11, 0), true);

        // The expired account's refresh is unscripted and fails transiently
        h.spotify.push_page(Ok(RecentPlaysPage {
            items: vec![play("t1", vec![artist("a1")], 180_000, utc(2025, 6, 4, 11, 30))],
            next_cursor: None,
            ..Default::default()
        }));

        let summary = h
            .sweeper
            .run_ingestion_sweep(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.accounts, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(h.store.plays(healthy.id).len(), 1);
        assert!(h.store.plays(unlinked.id).is_empty());
        assert!(h.store.plays(expired.id).is_empty());
    }

    #[tokio::test]
    async fn test_revoked_account_counted() {
        let h = harness(utc(2025, 6, 4, 12, 0));
        let account = add_account(&h, utc(2025, 6, 4, 11, 0), true);
        h.spotify
            .push_refresh(Err(SpotifyError::Revoked("invalid_grant".to_string())));

        let summary = h
            .sweeper
            .run_ingestion_sweep(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.revoked, 1);
        assert!(h.store.list_associations(account.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_sweep_starts_no_account() {
        let h = harness(utc(2025, 6, 4, 12, 0));
        add_account(&h, utc(2025, 6, 4, 13, 0), true);
        add_account(&h, utc(2025, 6, 4, 13, 0), true);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = h.sweeper.run_ingestion_sweep(&cancel).await.unwrap();

        assert_eq!(summary.cancelled, 2);
        assert!(h.spotify.fetch_calls().is_empty());
    }

    #[tokio::test]
    async fn test_weekly_sweep_freezes_finished_week() {
        // Monday 00:15, inside the grace window
        let h = harness(utc(2025, 6, 9, 0, 15));
        let listener = add_account(&h, utc(2025, 6, 9, 1, 0), true);
        let silent = add_account(&h, utc(2025, 6, 9, 1, 0), true);
        h.store.insert_play(
            listener.id,
            &play("t1", vec![artist("a1")], 180_000, utc(2025, 6, 8, 23, 55)),
        );

        let cancel = CancellationToken::new();
        let summary = h.sweeper.run_weekly_aggregation_sweep(&cancel).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
        let stats = h.store.weekly_stats(listener.id);
        assert_eq!(stats[0].week_identifier, "2025-W23");
        assert!(h.store.weekly_stats(silent.id).is_empty());

        // Running it again changes nothing
        let again = h.sweeper.run_weekly_aggregation_sweep(&cancel).await.unwrap();
        assert_eq!(again.succeeded, 0);
        assert_eq!(h.store.weekly_stats(listener.id).len(), 1);
    }
}
