//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level` when it is set.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::BridgeError::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| crate::BridgeError::Config(format!("Logging already initialised: {}", e)))?;

    Ok(())
}

/// Map the `--debug` switch and an optional explicit level to a filter string
pub fn effective_level<'a>(debug: bool, explicit: Option<&'a str>, fallback: &'a str) -> &'a str {
    match (explicit, debug) {
        (Some(level), _) => level,
        (None, true) => "debug",
        (None, false) => fallback,
    }
}
