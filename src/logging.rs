use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG` wins over the configured level.
pub fn filter(level: &str, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { level };
        EnvFilter::try_new(format!("watchsync={}", level)).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Install the global subscriber. Safe to call more than once.
pub fn init(level: &str, verbose: bool) {
    let _ = tracing_subscriber::registry()
        .with(filter(level, verbose))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
