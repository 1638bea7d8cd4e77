use crate::db::Store;
use crate::db::models::LinkedAccount;
use crate::error::StoreError;
use crate::notify::{ChatDestination, NotificationKind, Notifier};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationReport {
    pub linked_account_id: Uuid,
    pub notifications_sent: usize,
    pub notifications_failed: usize,
    pub associations_removed: u64,
}

/// Tears down every workspace link of an account whose Spotify grant is gone.
#[derive(Clone)]
pub struct RevocationCascade {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl RevocationCascade {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Notify each linked Slack user, then drop the associations and the cursor.
    ///
    /// A failed notification is logged and counted but never stops the
    /// removal. The linked account row and its play history stay in place.
    pub async fn handle_revocation(
        &self,
        account: &LinkedAccount,
    ) -> Result<RevocationReport, StoreError> {
        let associations = self.store.list_associations(account.id).await?;

        tracing::warn!(
            linked_account_id = %account.id,
            spotify_user_id = %account.spotify_user_id,
            association_count = associations.len(),
            "Spotify access revoked, removing workspace links"
        );

        let mut notifications_sent = 0;
        let mut notifications_failed = 0;

        for association in &associations {
            let destination = ChatDestination::from(association);
            let kind = NotificationKind::ReconnectNeeded {
                workspace_name: association.workspace_name.clone(),
            };

            match self.notifier.notify(&destination, &kind).await {
                Ok(()) => notifications_sent += 1,
                Err(e) => {
                    notifications_failed += 1;
                    tracing::warn!(
                        linked_account_id = %account.id,
                        slack_workspace_id = %destination.workspace_id,
                        slack_user_id = %destination.channel,
                        error = %e,
                        "Failed to send reconnect notification"
                    );
                }
            }
        }

        let ids: Vec<Uuid> = associations.iter().map(|a| a.id).collect();
        let associations_removed = self.store.remove_associations(account.id, &ids).await?;

        tracing::info!(
            linked_account_id = %account.id,
            associations_removed,
            notifications_sent,
            notifications_failed,
            "Revocation handled"
        );

        Ok(RevocationReport {
            linked_account_id: account.id,
            notifications_sent,
            notifications_failed,
            associations_removed,
        })
    }
}
