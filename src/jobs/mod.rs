pub mod leaderboard;
pub mod scheduler;
pub mod sweep;

pub use leaderboard::{LeaderboardPoster, LeaderboardSummary};
pub use scheduler::spawn_scheduler;
pub use sweep::{SweepSummary, Sweeper};
