use std::sync::OnceLock;

use tracing_subscriber::fmt as tracing_fmt;
use tracing_subscriber::{EnvFilter, Registry, prelude::*, reload};

static FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// `RUST_LOG` wins over `default_level`; an unparsable level falls back to `info`.
pub fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Later calls, and calls made after another
/// subscriber was installed (as in tests), are ignored.
pub fn init_logging(log_level: &str) {
    FILTER.get_or_init(|| {
        let (filter, handle) = reload::Layer::new(build_filter(log_level));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_fmt::layer().with_writer(std::io::stderr))
            .try_init();
        handle
    });
}

/// Swap the level of the installed subscriber, for a level that only became
/// known after logging started (from the configuration file).
pub fn set_log_level(log_level: &str) {
    if let Some(handle) = FILTER.get() {
        if let Err(e) = handle.reload(build_filter(log_level)) {
            tracing::debug!("Log level not changed: {e}");
        }
    }
}
