#![forbid(unsafe_code)]

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "vidrelay=info,backend=info,tower_http=info";

/// Installs the global fmt subscriber. `RUST_LOG` wins over the default filter.
pub fn init_logging() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!("setting default subscriber failed: {err}"))
}
