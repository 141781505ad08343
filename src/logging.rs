use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "STUDY_SCHEDULER_LOG";

/// Installs the global fmt subscriber. `STUDY_SCHEDULER_LOG` takes an
/// `EnvFilter` directive and falls back to `default_level`.
pub fn init(default_level: &str) -> Result<(), String> {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| format!("failed to initialize tracing subscriber: {error}"))
}
