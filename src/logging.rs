//! Tracing subscriber setup for embedding applications

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a global subscriber. `RUST_LOG` takes precedence over `verbose`.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_logging(verbose: bool, json: bool) -> bool {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (plain, structured) = if json {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (Some(fmt::layer().with_target(false)), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(structured)
        .try_init()
        .is_ok()
}
