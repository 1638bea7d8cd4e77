pub mod aggregator;
pub mod service;

pub use aggregator::{AggregateOutcome, WeeklyAggregator};
pub use service::{LeaderboardEntry, StatsService, WindowKind};
