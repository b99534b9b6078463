//! Logging for the assessctl CLI
//!
//! Usage:
//!   assessctl --debug stats                           # store + CLI at debug, sqlx at info
//!   RUST_LOG=assessctl_store=trace assessctl list     # RUST_LOG always wins
//!
//! Logs go to stderr; command output on stdout stays pipeable into `jq`.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Raise the store and CLI targets to debug when RUST_LOG is unset
    pub debug: bool,
}

/// Filter used when RUST_LOG is not set.
///
/// sqlx logs every statement at info, so it stays at warn unless `--debug`.
fn default_directives(debug: bool) -> &'static str {
    if debug {
        "assessctl=debug,assessctl_store=debug,sqlx=info,warn"
    } else {
        "assessctl=info,assessctl_store=info,sqlx=warn,warn"
    }
}

pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config.debug)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.debug)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {}", err))
}
