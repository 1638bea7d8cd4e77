use crate::clock::Clock;
use crate::jobs::leaderboard::LeaderboardPoster;
use crate::jobs::sweep::Sweeper;
use crate::week::next_weekly_run;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// How long to sleep from `now` until the next weekly run.
pub fn until_next_weekly_run(now: DateTime<Utc>, delay: Duration) -> std::time::Duration {
    (next_weekly_run(now, delay) - now)
        .to_std()
        .unwrap_or_default()
}

/// Spawn the ingestion loop and the weekly aggregation loop.
///
/// Both loops exit once `cancel` fires; a sweep already running finishes its
/// in-flight accounts first.
pub fn spawn_scheduler(
    sweeper: Arc<Sweeper>,
    leaderboards: Arc<LeaderboardPoster>,
    clock: Arc<dyn Clock>,
    fetch_interval: std::time::Duration,
    aggregation_delay: Duration,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(ingestion_loop(sweeper.clone(), fetch_interval, cancel.clone())),
        tokio::spawn(weekly_loop(
            sweeper,
            leaderboards,
            clock,
            aggregation_delay,
            cancel,
        )),
    ]
}

async fn ingestion_loop(
    sweeper: Arc<Sweeper>,
    fetch_interval: std::time::Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        interval_secs = fetch_interval.as_secs(),
        "Ingestion scheduler started"
    );

    let mut ticker = tokio::time::interval(fetch_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = sweeper.run_ingestion_sweep(&cancel).await {
            tracing::error!(error = ?e, "Ingestion sweep failed to start");
        }
    }

    tracing::info!("Ingestion scheduler stopped");
}

async fn weekly_loop(
    sweeper: Arc<Sweeper>,
    leaderboards: Arc<LeaderboardPoster>,
    clock: Arc<dyn Clock>,
    aggregation_delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        let now = clock.now();
        let wait = until_next_weekly_run(now, aggregation_delay);

        tracing::info!(
            next_run = %next_weekly_run(now, aggregation_delay),
            wait_secs = wait.as_secs(),
            "Weekly aggregation scheduled"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        // Pick up Sunday-night plays before the week is frozen
        if let Err(e) = sweeper.run_ingestion_sweep(&cancel).await {
            tracing::error!(error = ?e, "Pre-aggregation ingestion sweep failed to start");
        }
        if let Err(e) = sweeper.run_weekly_aggregation_sweep(&cancel).await {
            tracing::error!(error = ?e, "Weekly aggregation sweep failed to start");
        }
        if let Err(e) = leaderboards.post_weekly_leaderboards(&cancel).await {
            tracing::error!(error = ?e, "Weekly leaderboard posting failed to start");
        }
    }

    tracing::info!("Weekly aggregation scheduler stopped");
}
