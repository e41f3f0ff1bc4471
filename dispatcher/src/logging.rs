//! Tracing setup for the dispatcher binary.
//!
//! Diagnostics go to stderr and are filtered by `RUST_LOG`. Notifications are
//! separate: they flow through the configured sink, not through tracing.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_directive` if unset or invalid.
///
/// # Example
/// ```bash
/// RUST_LOG=dispatcher=debug dispatcher run
/// ```
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
