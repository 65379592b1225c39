use clap::{Args, ValueEnum};
use nfsvol_derive::LayeredConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error(transparent)]
    Init(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Logger {
    pub log_format: LogFormat,
    pub log_level: LogLevel,
}

#[derive(Args, Debug, Clone, Default, Serialize, Deserialize, LayeredConfig)]
#[serde(rename_all = "kebab-case")]
#[layered(try_into = "Logger")]
pub struct LoggerArgs {
    /// Log output format
    #[arg(long, env = "NFSVOL_LOG_FORMAT", value_enum)]
    #[layered(default = LogFormat::Text)]
    pub log_format: Option<LogFormat>,

    /// Minimum level to log. `RUST_LOG` takes precedence when set.
    #[arg(long, env = "NFSVOL_LOG_LEVEL", value_enum)]
    #[layered(default = LogLevel::Info)]
    pub log_level: Option<LogLevel>,
}

impl Logger {
    /// Installs the global subscriber. Fails if one is already installed.
    pub fn init(&self) -> Result<(), LoggingError> {
        Ok(install(self.log_format, self.log_level)?)
    }
}

fn install(format: LogFormat, level: LogLevel) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
            .map_err(|e| anyhow::anyhow!(e.to_string())),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .map_err(|e| anyhow::anyhow!(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overlay;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let logger: Logger = LoggerArgs::default().try_into().unwrap();
        assert_eq!(logger.log_format, LogFormat::Text);
        assert_eq!(logger.log_level, LogLevel::Info);
    }

    #[test]
    fn test_top_layer_wins() {
        let file = LoggerArgs {
            log_format: Some(LogFormat::Json),
            log_level: Some(LogLevel::Debug),
        };
        let cli = LoggerArgs {
            log_format: None,
            log_level: Some(LogLevel::Warn),
        };
        let logger: Logger = file.overlay(cli).try_into().unwrap();
        assert_eq!(logger.log_format, LogFormat::Json);
        assert_eq!(logger.log_level, LogLevel::Warn);
    }

    #[test]
    fn test_second_init_fails() {
        let logger = Logger::default();
        let first = logger.init();
        // Another test in this binary may have installed one already.
        if first.is_ok() {
            assert!(logger.init().is_err());
        }
    }
}
