use crate::error::NotifyError;
use serde::Deserialize;
use serde_json::json;

/// Slack API response envelope
#[derive(Debug, Deserialize)]
pub struct SlackApiResponse {
    pub ok: bool,
    pub error: Option<String>,
}

/// Slack Web API client. Every call names the bot token to use, since a
/// token is only valid inside the workspace that issued it.
#[derive(Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    api_base_url: String,
}

impl SlackClient {
    pub fn new(api_base_url: &str, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Post a message to a channel, or to a user's DM when `channel` is a user ID
    ///
    /// # Arguments
    /// * `bot_token` - Bot token of the workspace the channel belongs to
    /// * `channel` - Channel ID or Slack user ID
    /// * `text` - Message text (mrkdwn)
    ///
    /// # Errors
    /// - `SlackApi` if the API call fails or returns an error
    pub async fn post_message(
        &self,
        bot_token: &str,
        channel: &str,
        text: &str,
    ) -> Result<(), NotifyError> {
        let url = format!("{}/chat.postMessage", self.api_base_url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(bot_token)
            .json(&json!({ "channel": channel, "text": text }))
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to call Slack API: {:?}", e);
                NotifyError::SlackApi(format!("Failed to call chat.postMessage: {}", e))
            })?;

        let api_response = response.json::<SlackApiResponse>().await.map_err(|e| {
            tracing::error!("Failed to parse Slack API response: {:?}", e);
            NotifyError::SlackApi(format!("Failed to parse response: {}", e))
        })?;

        if !api_response.ok {
            let error_msg = api_response
                .error
                .unwrap_or_else(|| "Unknown error".to_string());
            tracing::error!(
                channel = channel,
                error = error_msg,
                "Slack API returned error"
            );
            return Err(NotifyError::SlackApi(format!(
                "chat.postMessage failed: {}",
                error_msg
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::serve_once;

    #[test]
    fn test_deserialize_error_response() {
        let response: SlackApiResponse =
            serde_json::from_str(r#"{ "ok": false, "error": "channel_not_found" }"#).unwrap();
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("channel_not_found"));
    }

    #[test]
    fn test_deserialize_ok_response() {
        let response: SlackApiResponse =
            serde_json::from_str(r#"{ "ok": true, "channel": "D123", "ts": "1.2" }"#).unwrap();
        assert!(response.ok);
        assert_eq!(response.error, None);
    }

    #[tokio::test]
    async fn test_post_message_uses_given_token() {
        let (base_url, request) = serve_once("200 OK", r#"{"ok":true}"#).await;
        let client = SlackClient::new(&base_url, std::time::Duration::from_secs(5)).unwrap();

        client.post_message("xoxb-team-2", "C42", "hello").await.unwrap();

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /chat.postMessage"));
        assert!(request.to_ascii_lowercase().contains("bearer xoxb-team-2"));
        assert!(request.contains(r#""channel":"C42""#));
    }

    #[tokio::test]
    async fn test_post_message_surfaces_slack_error() {
        let (base_url, _request) =
            serve_once("200 OK", r#"{"ok":false,"error":"channel_not_found"}"#).await;
        let client = SlackClient::new(&base_url, std::time::Duration::from_secs(5)).unwrap();

        let err = client.post_message("xoxb-1", "C42", "hello").await.unwrap_err();

        assert!(err.to_string().contains("channel_not_found"));
    }
}
