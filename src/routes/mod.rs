use crate::error::AppError;
use crate::stats::service::{LeaderboardEntry, StatsView};
use crate::stats::{StatsService, WindowKind};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub stats: Arc<StatsService>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    window: Option<WindowKind>,
}

impl StatsQuery {
    fn window(&self) -> WindowKind {
        self.window.unwrap_or(WindowKind::CalendarWeek)
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/accounts/{id}/stats", get(account_stats))
        .route("/workspaces/{id}/stats", get(workspace_stats))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn account_stats(
    State(state): State<AppState>,
    Path(linked_account_id): Path<Uuid>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsView>, AppError> {
    state
        .stats
        .get_weekly_stats(linked_account_id, query.window())
        .await?
        .map(Json)
        .ok_or_else(|| {
            AppError::NotFound(format!("No stats available for account {}", linked_account_id))
        })
}

async fn workspace_stats(
    State(state): State<AppState>,
    Path(slack_workspace_id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Vec<LeaderboardEntry>>, AppError> {
    let entries = state
        .stats
        .get_workspace_stats(&slack_workspace_id, query.window())
        .await?;
    Ok(Json(entries))
}
