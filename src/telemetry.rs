use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// `RUST_LOG_FORMAT=json` selects JSON lines; anything else is pretty.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `rust_log` when set.
pub fn init_tracing(rust_log: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(rust_log));

    let format = LogFormat::parse(std::env::var("RUST_LOG_FORMAT").ok().as_deref());

    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    };

    match result {
        Ok(()) => tracing::info!(format = ?format, "Tracing initialized"),
        Err(e) => eprintln!("Tracing already initialized: {}", e),
    }
}
