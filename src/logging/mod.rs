//! # Logging Module
//!
//! Process-wide `tracing` setup. Console output always goes to stderr so command output on
//! stdout stays machine-readable. When an emitter is supplied, the [`SqlLogLayer`] is added
//! and every event that passes the filter is also shipped to the SQL sink.

use crate::emitter::{LogEmitter, SqlLogLayer};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber
///
/// `filter` uses `EnvFilter` directive syntax; an unparsable filter falls back to `info`.
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(filter: &str, emitter: Option<LogEmitter>) -> bool {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(emitter.map(SqlLogLayer::new))
        .try_init()
        .is_ok()
}
