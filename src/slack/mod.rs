pub mod client;
pub mod notifier;

pub use client::SlackClient;
pub use notifier::SlackNotifier;
