//! Tracing subscriber setup for binaries and tests embedding the runtime.
//!
//! The library itself only emits `tracing` events; nothing here runs unless
//! the host calls [`init_tracing`].

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::LoggingConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Environment variable that forces the log format (`json` or `text`).
pub const LOG_FORMAT_ENV: &str = "MUXRPC_LOG_FORMAT";

fn wants_json(config: &LoggingConfig, format_env: Option<&str>) -> bool {
    match format_env {
        Some(v) if v.eq_ignore_ascii_case("json") => true,
        Some(v) if v.eq_ignore_ascii_case("text") => false,
        _ => config.json_logs,
    }
}

/// Install the global subscriber once for the process.
///
/// `RUST_LOG` takes precedence over `config.log_level`, and
/// `MUXRPC_LOG_FORMAT` over `config.json_logs`. Later calls, or a
/// subscriber installed elsewhere, leave things as they are.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let format = std::env::var(LOG_FORMAT_ENV).ok();

        let result = if wants_json(config, format.as_deref()) {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_env_overrides_config() {
        let json = LoggingConfig {
            json_logs: true,
            ..LoggingConfig::default()
        };
        assert!(wants_json(&json, None));
        assert!(!wants_json(&json, Some("TEXT")));
        assert!(wants_json(&LoggingConfig::default(), Some("json")));
        assert!(!wants_json(&LoggingConfig::default(), Some("yaml")));
    }

    #[test]
    fn init_tracing_is_idempotent() {
        let config = LoggingConfig {
            log_level: "not a [valid filter".to_string(),
            ..LoggingConfig::default()
        };
        init_tracing(&config);
        init_tracing(&LoggingConfig::default());
    }
}
