use crate::clock::Clock;
use crate::db::Store;
use crate::db::models::SlackWorkspace;
use crate::error::{NotifyError, StoreError};
use crate::notify::{ChatDestination, NotificationKind, Notifier};
use crate::stats::StatsService;
use crate::week::{WeekWindow, week_window};
use chrono::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LeaderboardSummary {
    pub workspaces: usize,
    pub posted: usize,
    /// No member had a stat for the week.
    pub empty: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Posts each workspace's ranking to its stats channel once a week is frozen.
pub struct LeaderboardPoster {
    store: Arc<dyn Store>,
    stats: Arc<StatsService>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl LeaderboardPoster {
    pub fn new(
        store: Arc<dyn Store>,
        stats: Arc<StatsService>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            stats,
            notifier,
            clock,
            grace,
        }
    }

    /// Post the leaderboard of the most recently completed week.
    ///
    /// A failing workspace is logged and counted; the rest still get theirs.
    ///
    /// # Errors
    /// Returns `StoreError` only if the workspace list itself cannot be loaded
    pub async fn post_weekly_leaderboards(
        &self,
        cancel: &CancellationToken,
    ) -> Result<LeaderboardSummary, StoreError> {
        let week = week_window(self.clock.now(), self.grace);
        let workspaces = self.store.list_leaderboard_workspaces().await?;

        tracing::info!(
            workspaces = workspaces.len(),
            week_identifier = %week.identifier,
            "Posting weekly leaderboards"
        );

        let mut summary = LeaderboardSummary {
            workspaces: workspaces.len(),
            ..Default::default()
        };

        for workspace in &workspaces {
            if cancel.is_cancelled() {
                summary.cancelled += 1;
                continue;
            }

            match self.post_workspace(workspace, &week).await {
                Ok(true) => summary.posted += 1,
                Ok(false) => summary.empty += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        slack_workspace_id = %workspace.slack_workspace_id,
                        week_identifier = %week.identifier,
                        error = %e,
                        "Failed to post weekly leaderboard"
                    );
                }
            }
        }

        tracing::info!(
            week_identifier = %week.identifier,
            posted = summary.posted,
            empty = summary.empty,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Weekly leaderboards posted"
        );

        Ok(summary)
    }

    async fn post_workspace(
        &self,
        workspace: &SlackWorkspace,
        week: &WeekWindow,
    ) -> Result<bool, NotifyError> {
        let Some(channel) = workspace.leaderboard_channel() else {
            return Ok(false);
        };

        let entries = self
            .stats
            .get_workspace_week(&workspace.slack_workspace_id, &week.identifier)
            .await?;
        if entries.is_empty() {
            tracing::debug!(
                slack_workspace_id = %workspace.slack_workspace_id,
                week_identifier = %week.identifier,
                "No member stats for the week, skipping leaderboard"
            );
            return Ok(false);
        }

        let destination = ChatDestination::channel(&workspace.slack_workspace_id, channel);
        let kind = NotificationKind::WeeklyLeaderboard {
            week_identifier: week.identifier.clone(),
            entries,
        };
        self.notifier.notify(&destination, &kind).await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::MemoryStore;
    use crate::stats::WeeklyAggregator;
    use crate::testing::{RecordingNotifier, artist, play, utc};
    use uuid::Uuid;

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<FixedClock>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                clock: Arc::new(FixedClock::new(utc(2025, 6, 9, 0, 15))),
            }
        }

        fn poster(&self, notifier: Arc<RecordingNotifier>) -> LeaderboardPoster {
            let stats = Arc::new(StatsService::new(
                self.store.clone(),
                self.clock.clone(),
                Duration::hours(1),
                Duration::minutes(5),
            ));
            LeaderboardPoster::new(
                self.store.clone(),
                stats,
                notifier,
                self.clock.clone(),
                Duration::hours(1),
            )
        }

        /// A member of `workspace` with `minutes` of listening frozen into week 23.
        async fn member(&self, workspace: &str, user: &str, minutes: i32) {
            let account_id = Uuid::new_v4();
            self.store.add_association(account_id, workspace, user, "Club");
            self.store.insert_play(
                account_id,
                &play("t1", vec![artist("a1")], minutes * 60_000, utc(2025, 6, 4, 12, 0)),
            );
            let week = week_window(self.clock.now(), Duration::hours(1));
            WeeklyAggregator::new(self.store.clone(), self.clock.clone())
                .aggregate(account_id, &week)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_posts_ranking_to_stats_channel() {
        let h = Harness::new();
        h.store.add_slack_workspace("T1", "xoxb-1");
        h.store.set_stats_channel("T1", Some("C1"), true);
        h.member("T1", "U1", 3).await;
        h.member("T1", "U2", 8).await;
        let notifier = Arc::new(RecordingNotifier::new());

        let summary = h
            .poster(notifier.clone())
            .post_weekly_leaderboards(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.posted, 1);
        let attempts = notifier.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].0, ChatDestination::channel("T1", "C1"));
        match &attempts[0].1 {
            NotificationKind::WeeklyLeaderboard {
                week_identifier,
                entries,
            } => {
                assert_eq!(week_identifier, "2025-W23");
                assert_eq!(entries[0].slack_user_id, "U2");
                assert_eq!(entries[1].slack_user_id, "U1");
            }
            other => panic!("expected a leaderboard, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disabled_or_channelless_workspaces_are_skipped() {
        let h = Harness::new();
        h.store.add_slack_workspace("T1", "xoxb-1");
        h.store.add_slack_workspace("T2", "xoxb-2");
        h.store.set_stats_channel("T2", Some("C2"), false);
        h.member("T1", "U1", 3).await;
        h.member("T2", "U2", 3).await;
        let notifier = Arc::new(RecordingNotifier::new());

        let summary = h
            .poster(notifier.clone())
            .post_weekly_leaderboards(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.workspaces, 0);
        assert!(notifier.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_workspace_does_not_stop_others() {
        let h = Harness::new();
        for (workspace, channel) in [("T1", "C1"), ("T2", "C_GONE"), ("T3", "C3"), ("T4", "C4")] {
            h.store.add_slack_workspace(workspace, "xoxb");
            h.store.set_stats_channel(workspace, Some(channel), true);
        }
        h.member("T1", "U1", 3).await;
        h.member("T2", "U2", 3).await;
        h.member("T3", "U3", 3).await;
        // T4 has no member with a stat
        let notifier = Arc::new(RecordingNotifier::failing_for(&["C_GONE"]));

        let summary = h
            .poster(notifier.clone())
            .post_weekly_leaderboards(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            summary,
            LeaderboardSummary {
                workspaces: 4,
                posted: 2,
                empty: 1,
                failed: 1,
                cancelled: 0,
            }
        );
        assert_eq!(notifier.attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_posts_nothing() {
        let h = Harness::new();
        h.store.add_slack_workspace("T1", "xoxb-1");
        h.store.set_stats_channel("T1", Some("C1"), true);
        h.member("T1", "U1", 3).await;
        let notifier = Arc::new(RecordingNotifier::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = h
            .poster(notifier.clone())
            .post_weekly_leaderboards(&cancel)
            .await
            .unwrap();

        assert_eq!(summary.cancelled, 1);
        assert!(notifier.attempts().is_empty());
    }
}
