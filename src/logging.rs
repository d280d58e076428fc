//! Logging setup using `tracing-subscriber`.
//!
//! Human-readable output on stderr; `RUST_LOG` overrides the configured
//! default filter. The process supervisor is expected to collect stderr,
//! so there is no file sink here.

use tracing_subscriber::EnvFilter;

/// Initialise tracing for the broker process.
///
/// `default_level` is used when `RUST_LOG` is not set (e.g. "info",
/// "toolbroker=debug").
pub fn init(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
