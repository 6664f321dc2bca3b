//! Shared tracing/logging initialization.
//!
//! Components never touch global logging state themselves; binaries and test
//! harnesses call [`init_tracing`] once and hand spans to the components.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"tether_client=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let result = if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Initialise tracing from the `logging` section of a resolved [`crate::Config`].
pub fn init_from_config(logging: &LoggingConfig) {
    init_tracing(&logging.filter, logging.json);
}
