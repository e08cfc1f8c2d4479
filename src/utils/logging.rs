//! Logging setup.
//!
//! `RUST_LOG` wins when it holds valid directives (for example
//! `mqtt_core_broker::broker=debug,info`). Otherwise the level given on the
//! command line applies to everything; an unknown level falls back to `info`.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Builds the filter used by [`init`].
pub fn filter_for(default_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = default_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    EnvFilter::default().add_directive(level.into())
}

pub fn init(default_level: &str) {
    // try_init: tests call this more than once per process
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for(default_level))
        .with_target(false)
        .try_init();
}
