//! Logging setup for the binaries and the lifecycle events they share.

use std::env;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LEVEL_VAR: &str = "VOLTGUARD_LOG_LEVEL";
const FORMAT_VAR: &str = "VOLTGUARD_LOG_FORMAT";
const TARGET_VAR: &str = "VOLTGUARD_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `voltguard=debug`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Unset or unparseable variables keep their defaults.
pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();
    if let Some(level) = env_value(LEVEL_VAR) {
        config.level = level;
    }
    if let Some(format) = env_value(FORMAT_VAR).and_then(|raw| raw.parse().ok()) {
        config.format = format;
    }
    if let Some(include_target) = env_value(TARGET_VAR).and_then(|raw| parse_switch(&raw)) {
        config.include_target = include_target;
    }
    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target);

    match config.format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(builder.with_ansi(false).json().finish())?
        }
        LogFormat::Pretty => {
            tracing::subscriber::set_global_default(builder.with_ansi(true).pretty().finish())?
        }
    }
    Ok(())
}

pub fn log_app_start(app: &'static str, config: &LoggingConfig) {
    info!(
        component = app,
        event = "app.start",
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

/// `reason` names the variable that picked the source, if any.
pub fn log_source_selected(app: &'static str, source: &str, reason: Option<&str>) {
    info!(
        component = app,
        event = "source.selected",
        source,
        reason = reason.unwrap_or("default")
    );
}

pub fn log_output_written(app: &'static str, kind: &str, path: &Path, rows: usize) {
    info!(
        component = app,
        event = "output.written",
        kind,
        path = %path.display(),
        rows
    );
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
