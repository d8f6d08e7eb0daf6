//! Logging configuration and initialization
//!
//! The crate emits `tracing` events and spans: option tuning, graph closing and chunk reads
//! at debug level, one span per realization. This module installs a subscriber for
//! applications that do not bring their own.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter (e.g. "info", "warn,latfield=debug")
//! - `LATFIELD_LOG_LEVEL`: simple log level (error, warn, info, debug, trace)
//! - `LATFIELD_LOG_FORMAT`: output format ("human" or "json")

use std::str::FromStr;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::errors::LoggingError;

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "LATFIELD_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "LATFIELD_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLogLevel(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "console" => Ok(LogFormat::Human),
            "json" | "structured" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidLogFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Whether to include file/line in logs
    pub with_file_info: bool,
    /// Whether to log when spans close, with their duration
    pub with_span_events: bool,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    /// Configuration from `LATFIELD_LOG_LEVEL` and `LATFIELD_LOG_FORMAT`, ignoring bad values
    pub fn from_env() -> Self {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        LoggingConfig::new().with_level(level).with_format(format)
    }
}

/// Initializes logging from the environment, doing nothing if already initialized
pub fn init_logging_default() {
    init_logging_from_env().ok();
}

pub fn init_logging_from_env() -> Result<(), LoggingError> {
    init_logging(&LoggingConfig::from_env())
}

/// Initializes logging with `config`
///
/// Only the first call installs a subscriber, later calls return `Ok(())`. Fails when
/// another subscriber has been installed by someone else.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let mut result = Ok(());
    TRACING_INITIALIZED.get_or_init(|| {
        result = install(config);
    });
    result
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;
    let installed = match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_target(false)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info)
                .with_span_events(span_events(config.with_span_events));
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init()
        }
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info)
                .with_span_events(span_events(config.with_span_events));
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init()
        }
    };
    installed.map_err(|e| LoggingError::Install(e.to_string()))
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// `RUST_LOG` first, then `LATFIELD_LOG_LEVEL`, then the configured level
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log)
            .map_err(|e| LoggingError::InvalidLogLevel(e.to_string()));
    }
    if let Some(level) = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|s| s.parse::<LogLevel>().ok())
    {
        return Ok(EnvFilter::new(level.as_filter_str()));
    }
    Ok(EnvFilter::new(default_level.as_filter_str()))
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}
