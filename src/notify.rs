use crate::db::models::Association;
use crate::error::NotifyError;
use crate::stats::LeaderboardEntry;
use async_trait::async_trait;

/// Where a message goes: a channel, or a user's DM when `channel` is a user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatDestination {
    pub workspace_id: String,
    pub channel: String,
}

impl ChatDestination {
    pub fn channel(workspace_id: &str, channel: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            channel: channel.to_string(),
        }
    }
}

/// The Slack user behind an association, reached by DM.
impl From<&Association> for ChatDestination {
    fn from(association: &Association) -> Self {
        Self {
            workspace_id: association.slack_workspace_id.clone(),
            channel: association.slack_user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// The Spotify link behind this workspace membership died and must be redone.
    ReconnectNeeded { workspace_name: String },
    /// A workspace's ranking for a frozen week.
    WeeklyLeaderboard {
        week_identifier: String,
        entries: Vec<LeaderboardEntry>,
    },
}

impl NotificationKind {
    pub fn text(&self) -> String {
        match self {
            NotificationKind::ReconnectNeeded { workspace_name } => format!(
                ":warning: *Spotify connection expired*\n\n\
                 Your Spotify connection for *{workspace_name}* has expired and we can no \
                 longer track your listening history.\n\n\
                 To continue tracking your music, connect your Spotify account again from \
                 *{workspace_name}*.\n\n\
                 _Your previous stats are still saved!_"
            ),
            NotificationKind::WeeklyLeaderboard {
                week_identifier,
                entries,
            } => {
                let mut text = format!(":trophy: *Weekly listening leaderboard* ({week_identifier})\n");
                for (rank, entry) in entries.iter().enumerate() {
                    text.push_str(&format!(
                        "\n{}. <@{}> {} min, {} plays",
                        rank + 1,
                        entry.slack_user_id,
                        entry.total_minutes,
                        entry.total_plays
                    ));
                }
                text
            }
        }
    }
}

/// Fire-and-forget delivery of messages to chat users and channels.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        destination: &ChatDestination,
        kind: &NotificationKind,
    ) -> Result<(), NotifyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_reconnect_text_names_workspace() {
        let text = NotificationKind::ReconnectNeeded {
            workspace_name: "Music Club".to_string(),
        }
        .text();

        assert!(text.contains("*Music Club*"));
        assert!(text.contains("connect your Spotify account again"));
    }

    #[test]
    fn test_leaderboard_text_ranks_members() {
        let entry = |user: &str, minutes, plays| LeaderboardEntry {
            slack_user_id: user.to_string(),
            linked_account_id: Uuid::new_v4(),
            total_minutes: minutes,
            total_plays: plays,
        };
        let text = NotificationKind::WeeklyLeaderboard {
            week_identifier: "2025-W23".to_string(),
            entries: vec![entry("U2", 120, 40), entry("U1", 9, 3)],
        }
        .text();

        assert!(text.contains("(2025-W23)"));
        assert!(text.contains("\n1. <@U2> 120 min, 40 plays"));
        assert!(text.contains("\n2. <@U1> 9 min, 3 plays"));
    }
}
