//! Logging setup for the `graph-layout` binary
//!
//! Library code only emits `tracing` events; installing a subscriber is left to
//! the binary.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize tracing with the default `warn` filter
pub fn init() {
    init_with_filter("warn");
}

/// Initialize tracing with a custom default filter
///
/// `RUST_LOG` takes precedence when set. Output goes to stderr so stdout stays
/// free for command results. A second call is a no-op.
pub fn init_with_filter(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init();
}
