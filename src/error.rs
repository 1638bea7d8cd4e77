use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Persistence failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Failures talking to Spotify
///
/// Only `Revoked` is permanent. Everything else is retried on the next scheduled run.
#[derive(Debug, Error)]
pub enum SpotifyError {
    #[error("Refresh token expired or revoked: {0}")]
    Revoked(String),

    #[error("Spotify request timed out")]
    Timeout,

    #[error("Spotify API error: {0}")]
    Api(String),
}

impl SpotifyError {
    pub fn is_revocation(&self) -> bool {
        matches!(self, SpotifyError::Revoked(_))
    }
}

/// Outcome of asking for a usable access token
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Spotify credentials revoked for linked account {0}")]
    Revoked(Uuid),

    #[error("Token refresh failed: {0}")]
    Transient(SpotifyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures that end one account's ingestion run without touching its cursor
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Transient(SpotifyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Slack API error: {0}")]
    SlackApi(String),

    #[error("Bot is not installed in Slack workspace {0}")]
    NotInstalled(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Application-specific errors with HTTP status code mappings
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::NotFound(msg) => {
                tracing::debug!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, msg.as_str())
            }
            AppError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, msg.as_str())
            }
            AppError::Store(err) => {
                tracing::error!("Store error: {:?}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
            AppError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, Json(json!({ "error": error_message }))).into_response()
    }
}
