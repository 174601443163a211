//! Subscriber setup for the binary.
//!
//! Library crates log through the `log` facade; the subscriber's log bridge
//! turns those records into tracing events.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` when set, else `default_level`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(default_level: &str, json: bool) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter(default_level))
        .with_target(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("installing log subscriber: {e}"))
}
