// Subscriber setup for the binaries.
//
// Library code only emits `tracing` events; installing a subscriber is left to
// whoever owns the process. `RUST_LOG` wins over the level passed in, so
// `RUST_LOG=huddle_relay=debug` turns on per-chunk traffic logging without a
// flag.

use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_level` (e.g. `"info"`). Returns an error if a subscriber is
/// already installed.
pub fn init_logging(default_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
}
