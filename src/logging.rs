use tracing_subscriber::{EnvFilter, fmt};

/// Diagnostics go to stderr; stdout is reserved for entry names and errors.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
