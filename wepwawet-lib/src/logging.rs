use tracing_subscriber::EnvFilter;

const ENV_VAR_LOG_FILTER: &str = "WEPWAWET_LOG";

/// Install the global subscriber. The environment variable wins over the
/// level passed on the command line.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_env(ENV_VAR_LOG_FILTER).unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
