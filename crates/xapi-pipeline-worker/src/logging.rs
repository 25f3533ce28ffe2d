use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Installs the process-wide subscriber. `RUST_LOG` wins over `default_level`.
/// Logs go to stderr; stdout carries command reports.
pub fn init_tracing(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}
