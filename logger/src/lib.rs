//! Global `tracing` logger configuration for the bridge binary and its tests.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Log targets which are very chatty at INFO and are capped at WARN unless
/// `RUST_LOG` says otherwise.
const NOISY_TARGETS: [&str; 3] =
    ["nostr_relay_pool", "nostr_sdk", "hyper_util"];

/// Initialize a global `tracing` logger.
///
/// + The logger will print enabled `tracing` events and spans to stdout.
/// + The default log level includes INFO, WARN, and ERROR events, except for
///   the relay client internals which default to WARN.
/// + You can change the log level or module filtering with an appropriate
///   `RUST_LOG` env var set. Read more about the syntax here:
///   <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.Targets.html>
///
/// Panics if a logger is already initialized. This will fail if used in tests,
/// since multiple test threads will compete to set the global logger.
pub fn init() {
    try_init().expect("Failed to setup logger");
}

/// Use this to initialize the global logger in tests.
pub fn init_for_testing() {
    // Quickly skip logger setup if no env var set.
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }

    // Don't panic if there's already a logger setup. Multiple tests might try
    // setting the global logger.
    let _ = try_init();
}

/// Try to initialize a global logger. Will return an `Err` if there is another
/// global logger already set.
pub fn try_init() -> Result<(), TryInitError> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| parse_filter(&rust_log))
        .unwrap_or_else(default_filter);

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_ansi(true)
        .with_filter(filter);

    tracing_subscriber::registry().with(stdout_log).try_init()
}

/// INFO everywhere, WARN for [`NOISY_TARGETS`].
fn default_filter() -> Targets {
    NOISY_TARGETS
        .iter()
        .fold(Targets::new().with_default(Level::INFO), |targets, target| {
            targets.with_target(*target, Level::WARN)
        })
}

/// Parse a `RUST_LOG` value. Returns `None` if it is empty or malformed, in
/// which case the caller falls back to [`default_filter`].
fn parse_filter(rust_log: &str) -> Option<Targets> {
    let rust_log = rust_log.trim();
    if rust_log.is_empty() {
        return None;
    }
    Targets::from_str(rust_log).ok()
}
