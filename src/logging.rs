//! tracing-subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Filter from `RUST_LOG`, else `verbose` → debug, else the configured level.
pub fn env_filter(config: &LoggingConfig, verbose: bool) -> EnvFilter {
    let default_level = if verbose { "debug" } else { config.level.as_str() };
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber, writing to stderr so the stage view on
/// stdout stays readable. Safe to call more than once.
pub fn init(config: &LoggingConfig, verbose: bool) {
    let filter = env_filter(config, verbose);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
