//! Diagnostic tracing for the healer binaries.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. Run logs that are
//! part of the product (the `logs` list in run state and the run record) are
//! unaffected by the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber.
///
/// Reads `RUST_LOG`, falling back to `default_filter` when unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=healer=debug healer run --repo https://github.com/o/r
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
