//! Logging setup.

use tracing_subscriber::EnvFilter;

/// Install the global `fmt` subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `default_filter`.
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("Tracing initialized");
    }
    installed
}
