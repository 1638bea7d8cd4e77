use crate::clock::Clock;
use crate::db::Store;
use crate::db::models::LinkedAccount;
use crate::error::{SpotifyError, TokenError};
use crate::spotify::SpotifyApi;
use chrono::Duration;
use std::sync::Arc;

/// Hands out access tokens that are valid for at least `buffer` longer.
#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn Store>,
    spotify: Arc<dyn SpotifyApi>,
    clock: Arc<dyn Clock>,
    buffer: Duration,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn Store>,
        spotify: Arc<dyn SpotifyApi>,
        clock: Arc<dyn Clock>,
        buffer: Duration,
    ) -> Self {
        Self {
            store,
            spotify,
            clock,
            buffer,
        }
    }

    /// Ensure a valid access token, refreshing if necessary
    ///
    /// Returns the stored token untouched while it is valid for longer than
    /// the buffer. Otherwise refreshes it with the account's own refresh
    /// strategy and persists the result.
    ///
    /// # Errors
    /// - `TokenError::Revoked` if Spotify rejected the refresh token for good
    /// - `TokenError::Transient` for any other refresh failure; try again next run
    /// - `TokenError::Store` if the new credentials could not be saved
    pub async fn ensure_valid_access_token(
        &self,
        account: &LinkedAccount,
    ) -> Result<String, TokenError> {
        let now = self.clock.now();

        if account.expires_at > now + self.buffer {
            tracing::debug!(
                linked_account_id = %account.id,
                expires_at = %account.expires_at,
                "Access token still valid, using existing token"
            );
            return Ok(account.access_token.clone());
        }

        let strategy = account.refresh_strategy();

        tracing::info!(
            linked_account_id = %account.id,
            expires_at = %account.expires_at,
            now = %now,
            strategy = ?strategy,
            "Access token expired or expiring soon, refreshing"
        );

        let refreshed = match self
            .spotify
            .refresh_token(&account.refresh_token, &strategy)
            .await
        {
            Ok(refreshed) => refreshed,
            Err(SpotifyError::Revoked(reason)) => {
                tracing::warn!(
                    linked_account_id = %account.id,
                    spotify_user_id = %account.spotify_user_id,
                    reason = %reason,
                    "Refresh token expired or revoked"
                );
                return Err(TokenError::Revoked(account.id));
            }
            Err(e) => {
                tracing::warn!(
                    linked_account_id = %account.id,
                    error = %e,
                    "Token refresh failed, will retry next run"
                );
                return Err(TokenError::Transient(e));
            }
        };

        let expires_at = now + refreshed.expires_in;

        self.store
            .update_credentials(
                account.id,
                &refreshed.access_token,
                refreshed.refresh_token.as_deref(),
                expires_at,
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    linked_account_id = %account.id,
                    error = ?e,
                    "Failed to update tokens in database"
                );
                e
            })?;

        tracing::info!(
            linked_account_id = %account.id,
            new_expires_at = %expires_at,
            refresh_token_rotated = refreshed.refresh_token.is_some(),
            "Successfully refreshed and stored access token"
        );

        Ok(refreshed.access_token)
    }
}
