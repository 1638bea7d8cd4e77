use crate::db::Store;
use crate::error::NotifyError;
use crate::notify::{ChatDestination, NotificationKind, Notifier};
use crate::slack::SlackClient;
use async_trait::async_trait;
use std::sync::Arc;

/// Delivers notifications through Slack with the bot token of the
/// destination's workspace.
#[derive(Clone)]
pub struct SlackNotifier {
    client: SlackClient,
    store: Arc<dyn Store>,
}

impl SlackNotifier {
    pub fn new(client: SlackClient, store: Arc<dyn Store>) -> Self {
        Self { client, store }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(
        &self,
        destination: &ChatDestination,
        kind: &NotificationKind,
    ) -> Result<(), NotifyError> {
        let workspace = self
            .store
            .get_slack_workspace(&destination.workspace_id)
            .await?
            .ok_or_else(|| NotifyError::NotInstalled(destination.workspace_id.clone()))?;

        self.client
            .post_message(&workspace.bot_token, &destination.channel, &kind.text())
            .await?;

        tracing::info!(
            slack_workspace_id = %destination.workspace_id,
            channel = %destination.channel,
            kind = ?kind,
            "Sent Slack notification"
        );

        Ok(())
    }
}
