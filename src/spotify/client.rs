use crate::config::Config;
use crate::db::models::RefreshStrategy;
use crate::error::SpotifyError;
use crate::spotify::models::RecentlyPlayedResponse;
use crate::spotify::{RecentPlaysPage, RefreshedToken, SpotifyApi};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, RefreshToken, RequestTokenError, TokenResponse, TokenUrl,
};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU16, Ordering};

/// HTTP client for the Spotify Web API and accounts service
#[derive(Clone)]
pub struct SpotifyClient {
    http: reqwest::Client,
    api_base_url: String,
    shared_secret_client: BasicClient,
    auth_url: AuthUrl,
    token_url: TokenUrl,
    timeout: std::time::Duration,
}

impl SpotifyClient {
    /// Build the client from configuration.
    ///
    /// # Errors
    /// Returns error if the accounts URLs are malformed or the HTTP client
    /// cannot be constructed
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let accounts = config.spotify_accounts_base_url.trim_end_matches('/');
        let auth_url = AuthUrl::new(format!("{}/authorize", accounts))?;
        let token_url = TokenUrl::new(format!("{}/api/token", accounts))?;

        let shared_secret_client = BasicClient::new(
            ClientId::new(config.spotify_client_id.clone()),
            Some(ClientSecret::new(config.spotify_client_secret.clone())),
            auth_url.clone(),
            Some(token_url.clone()),
        );

        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()?;

        Ok(Self {
            http,
            api_base_url: config.spotify_api_base_url.trim_end_matches('/').to_string(),
            shared_secret_client,
            auth_url,
            token_url,
            timeout: config.http_timeout(),
        })
    }

    fn oauth_client(&self, strategy: &RefreshStrategy) -> BasicClient {
        match strategy {
            RefreshStrategy::SharedSecret => self.shared_secret_client.clone(),
            // Client-bound links were authorized without a secret; the client id
            // travels in the request body instead of a Basic auth header.
            RefreshStrategy::ClientBound { client_id } => BasicClient::new(
                ClientId::new(client_id.clone()),
                None,
                self.auth_url.clone(),
                Some(self.token_url.clone()),
            ),
        }
    }
}

/// Client errors that are worth retrying.
fn is_retryable_client_error(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
    )
}

/// Map a failed token request onto transient vs permanent.
///
/// A client-error status from the token endpoint means the refresh token is
/// dead, whatever the body says (Spotify sometimes answers with an empty or
/// non-OAuth body). Timeouts, rate limits, 5xx and network failures are
/// transient. Without a status, only a standard OAuth error code is permanent.
fn classify_refresh_error<RE>(
    status: Option<StatusCode>,
    err: RequestTokenError<RE, BasicErrorResponse>,
) -> SpotifyError
where
    RE: std::error::Error + 'static,
{
    let detail = match &err {
        RequestTokenError::ServerResponse(response) => response.error().to_string(),
        RequestTokenError::Request(e) => format!("token request failed: {}", e),
        RequestTokenError::Parse(e, _) => format!("unparseable token response: {}", e),
        RequestTokenError::Other(msg) => msg.clone(),
    };

    match status {
        Some(status) if status.is_client_error() && !is_retryable_client_error(status) => {
            SpotifyError::Revoked(format!("token endpoint returned {}: {}", status, detail))
        }
        Some(status) => {
            SpotifyError::Api(format!("token endpoint returned {}: {}", status, detail))
        }
        None => match err {
            RequestTokenError::ServerResponse(response)
                if !matches!(response.error(), BasicErrorResponseType::Extension(_)) =>
            {
                SpotifyError::Revoked(detail)
            }
            _ => SpotifyError::Api(detail),
        },
    }
}

fn map_reqwest_error(e: reqwest::Error) -> SpotifyError {
    if e.is_timeout() {
        SpotifyError::Timeout
    } else {
        SpotifyError::Api(e.to_string())
    }
}

#[async_trait]
impl SpotifyApi for SpotifyClient {
    async fn fetch_recent_plays(
        &self,
        access_token: &str,
        after: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<RecentPlaysPage, SpotifyError> {
        let url = format!("{}/me/player/recently-played", self.api_base_url);

        let mut request = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("limit", limit.to_string())]);
        if let Some(after) = after {
            request = request.query(&[("after", after.timestamp_millis().to_string())]);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(error = ?e, "Failed to call Spotify recently-played");
            map_reqwest_error(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = %status,
                body = %body.chars().take(200).collect::<String>(),
                "Spotify recently-played returned an error"
            );
            return Err(SpotifyError::Api(format!(
                "recently-played returned {}",
                status
            )));
        }

        let body = response
            .json::<RecentlyPlayedResponse>()
            .await
            .map_err(|e| {
                tracing::warn!(error = ?e, "Failed to parse recently-played response");
                map_reqwest_error(e)
            })?;

        let page = body.into_page();

        tracing::debug!(
            item_count = page.items.len(),
            next_cursor = ?page.next_cursor,
            "Fetched recently played tracks"
        );

        Ok(page)
    }

    async fn refresh_token(
        &self,
        refresh_token: &str,
        strategy: &RefreshStrategy,
    ) -> Result<RefreshedToken, SpotifyError> {
        let client = self.oauth_client(strategy);
        let refresh_token = RefreshToken::new(refresh_token.to_string());

        // oauth2 drops the HTTP status from its error; keep it for classification
        let status = AtomicU16::new(0);
        let status_ref = &status;
        let request = client
            .exchange_refresh_token(&refresh_token)
            .request_async(|req| async move {
                let response = async_http_client(req).await;
                if let Ok(response) = &response {
                    status_ref.store(response.status_code.as_u16(), Ordering::Relaxed);
                }
                response
            });

        let token_result = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                let status = StatusCode::from_u16(status.load(Ordering::Relaxed)).ok();
                let err = classify_refresh_error(status, e);
                tracing::warn!(
                    status = ?status,
                    revoked = err.is_revocation(),
                    error = %err,
                    "Spotify token refresh failed"
                );
                return Err(err);
            }
            Err(_) => return Err(SpotifyError::Timeout),
        };

        let expires_in = token_result.expires_in().ok_or_else(|| {
            tracing::warn!("No expires_in in token refresh response");
            SpotifyError::Api("No expiry time in token refresh response".to_string())
        })?;

        Ok(RefreshedToken {
            access_token: token_result.access_token().secret().to_string(),
            expires_in: Duration::seconds(expires_in.as_secs() as i64),
            refresh_token: token_result.refresh_token().map(|t| t.secret().to_string()),
        })
    }
}
