use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "TREEDER_LOG";

/// Logs go to stderr so stdout stays clean for outlines and JSON.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
