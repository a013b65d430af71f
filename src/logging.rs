//! Logging setup helper for hosts embedding the engine.
//!
//! The engine itself only emits `tracing` events; a host application that
//! has its own subscriber should skip this and the events will flow there.
//!
//! Log level can be controlled via the `PHOTODUP_LOG` environment variable:
//! - `PHOTODUP_LOG=debug` for verbose output
//! - `PHOTODUP_LOG=info` for standard output (default)
//! - `PHOTODUP_LOG=warn` for warnings and errors only

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a plain fmt subscriber. Returns quietly if a global subscriber
/// is already set, so library tests and embedding hosts cannot collide.
pub fn init() {
    let env_filter =
        EnvFilter::try_from_env("PHOTODUP_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_ansi(false))
        .try_init();
}
