pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod notify;
pub mod revocation;
pub mod routes;
pub mod slack;
pub mod spotify;
pub mod stats;
pub mod telemetry;
pub mod week;

#[cfg(test)]
mod testing;

use crate::clock::{Clock, SystemClock};
use crate::db::{PgStore, Store};
use crate::ingest::Ingestor;
use crate::jobs::{LeaderboardPoster, Sweeper, spawn_scheduler};
use crate::revocation::RevocationCascade;
use crate::slack::{SlackClient, SlackNotifier};
use crate::spotify::{SpotifyClient, TokenManager};
use crate::stats::{StatsService, WeeklyAggregator};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub async fn run(config: config::Config) -> anyhow::Result<()> {
    telemetry::init_tracing(&config.rust_log);

    let pool = db::init_pool(&config.database_url).await?;
    let pg_store = PgStore::new(pool);
    if let Some((workspace_id, bot_token)) = config.slack_installation() {
        pg_store.upsert_slack_workspace(workspace_id, bot_token).await?;
        tracing::info!(slack_workspace_id = workspace_id, "Installed configured Slack workspace");
    }
    let store: Arc<dyn Store> = Arc::new(pg_store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let spotify = Arc::new(SpotifyClient::new(&config)?);
    let slack = SlackClient::new(&config.slack_api_base_url, config.http_timeout())?;
    let notifier = Arc::new(SlackNotifier::new(slack, store.clone()));

    let tokens = TokenManager::new(
        store.clone(),
        spotify.clone(),
        clock.clone(),
        config.token_refresh_buffer(),
    );
    let revocation = RevocationCascade::new(store.clone(), notifier.clone());
    let ingestor = Ingestor::new(
        store.clone(),
        spotify,
        tokens,
        revocation,
        clock.clone(),
        config.recent_plays_page_size,
    );
    let aggregator = WeeklyAggregator::new(store.clone(), clock.clone());
    let sweeper = Arc::new(Sweeper::new(
        store.clone(),
        ingestor,
        aggregator,
        clock.clone(),
        config.week_rollover_grace(),
        config.sweep_concurrency,
    ));

    let stats = Arc::new(StatsService::new(
        store.clone(),
        clock.clone(),
        config.week_rollover_grace(),
        config.rolling_stats_cache_ttl(),
    ));
    let leaderboards = Arc::new(LeaderboardPoster::new(
        store,
        stats.clone(),
        notifier,
        clock.clone(),
        config.week_rollover_grace(),
    ));

    let cancel = CancellationToken::new();
    let jobs = spawn_scheduler(
        sweeper,
        leaderboards,
        clock,
        config.fetch_interval(),
        config.aggregation_delay(),
        cancel.clone(),
    );

    let app = Router::new()
        .merge(routes::routes(routes::AppState { stats }))
        .layer(TraceLayer::new_for_http());

    let ip: std::net::IpAddr = config.host.parse()?;
    let addr = SocketAddr::from((ip, config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    for job in jobs {
        if let Err(e) = job.await {
            tracing::error!(error = ?e, "Scheduler task panicked");
        }
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown requested, finishing in-flight accounts");
    cancel.cancel();
}
