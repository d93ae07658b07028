//! Tracing subscriber setup for processes hosting the connection manager.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the binary. `RUST_LOG` takes precedence over the level passed in.

use tracing::debug;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install a global subscriber, plain text or JSON.
///
/// Fails if a global subscriber is already set.
pub fn try_init_tracing(level: &str, json: bool) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(fmt::layer().json()).try_init()
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()
    }
}

/// Like [`try_init_tracing`], keeping an already-installed subscriber.
pub fn init_tracing(level: &str, json: bool) {
    if let Err(e) = try_init_tracing(level, json) {
        debug!(error = %e, "Tracing subscriber already installed, keeping it");
    }
}
