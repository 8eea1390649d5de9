//! Logging setup for embedders and test harnesses.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::CommsConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_filter` (e.g. `"dashpod_comms=debug"`).
/// With `log_json` each event is one JSON line. Returns `false` when a
/// subscriber is already installed, which leaves that one in place.
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let (json, text) = if log_json {
        (Some(fmt::layer().json()), None)
    } else {
        (None, Some(fmt::layer()))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .is_ok()
}

pub fn init_tracing_from_config(config: &CommsConfig) -> bool {
    init_tracing(&config.log_level, config.log_json)
}
