//! Tracing subscriber setup for hosting applications.

use tracing_subscriber::EnvFilter;

/// Installs a global subscriber filtered by `AGENTRY_LOG` (falling back
/// to `RUST_LOG`, then `warn`). Safe to call more than once; later calls
/// are no-ops.
pub fn init() {
    let filter = std::env::var("AGENTRY_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .try_init();
}
