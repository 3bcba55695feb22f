//! ---
//! rampart_section: "01-core-functionality"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Shared primitives and utilities for the resilience runtime."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "RAMPART_LOG";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Available log formats for processes embedding the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Build the filter used by [`init_tracing`].
///
/// `RAMPART_LOG` wins over `RUST_LOG`; `info` is used when neither parses.
pub fn env_filter() -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {} directive ({}); defaulting to info logging",
                LOG_ENV, err
            );
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Initialize the tracing subscriber based on configuration and environment variables.
///
/// * Structured JSON or pretty output goes to stdout according to `config.format`.
/// * When `config.directory` is set a daily rolling JSON file is written there as well.
///
/// Calling this more than once is harmless; only the first subscriber is installed.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = STDOUT_GUARD.set(stdout_guard);

    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let prefix = config
                .file_prefix
                .clone()
                .unwrap_or_else(|| service_name.to_owned());
            let appender = daily(directory, format!("{prefix}.log"));
            let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(file_guard);
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .json()
                    .with_writer(file_writer)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        log_dir = ?config.directory,
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: Some(dir.path().join("logs")),
            format: LogFormat::Pretty,
            file_prefix: Some("engine".into()),
        };
        init_tracing("rampart-test", &config).unwrap();
        init_tracing("rampart-test", &config).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn log_format_uses_kebab_case() {
        let format: LogFormat = parse_format("\"structured-json\"");
        assert_eq!(format, LogFormat::StructuredJson);
    }

    fn parse_format(raw: &str) -> LogFormat {
        #[derive(Deserialize)]
        struct Wrapper {
            format: LogFormat,
        }
        let wrapper: Wrapper = toml::from_str(&format!("format = {raw}")).unwrap();
        wrapper.format
    }
}
