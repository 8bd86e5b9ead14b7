//! Shared tracing/logging initialization.
//!
//! The `tunlink` binary and any embedding host use the same pattern for
//! setting up `tracing_subscriber` with an env-filter and optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"tunlink=info,tunlink_client=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Calling this twice is harmless: the second registration fails silently and
/// the first subscriber stays installed.
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
        tracing::debug!("Global tracing subscriber already installed");
    }
}

/// Build the default filter directive for a given level, covering every
/// `tunlink` crate.
pub fn default_filter(level: &str) -> String {
    format!("tunlink={level},tunlink_client={level},tunlink_core={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_all_crates() {
        let filter = default_filter("debug");
        assert_eq!(
            filter,
            "tunlink=debug,tunlink_client=debug,tunlink_core=debug"
        );
    }
}
