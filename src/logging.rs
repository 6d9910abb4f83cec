//! Tracing subscriber setup for the `aerorun` binary.
//!
//! Logs go to stderr so they never interleave with the progress display.
//! `RUST_LOG` wins when set; otherwise only warnings are shown, or debug
//! output for this crate with `--verbose`.

use std::io;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "aerorun=debug,info" } else { "warn" }
}

/// Installs the global subscriber. Calling it twice is harmless; the second
/// call leaves the first subscriber in place.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .try_init();
}
