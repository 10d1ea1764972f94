//! Tracing setup for embedders and tests.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Installs a formatted subscriber at `level`, unless `RUST_LOG` says otherwise.
///
/// Returns `false` when a global subscriber was already installed, so calling
/// this more than once is harmless.
pub fn init_tracing(level: Level) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
