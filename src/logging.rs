//! Process-wide log setup.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber. `RUST_LOG` wins over `default_filter`; an
/// unparsable `default_filter` falls back to `info`.
///
/// # Errors
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("install tracing subscriber: {err}"))
}
