//! Process-wide logging setup.
//!
//! Configured from the environment:
//! - `TCPWIRE_LOG`: level for this crate (`trace`, `debug`, `info`, `warn`, `error`), default `info`
//! - `TCPWIRE_LOG_HANDLER`: `console` (stderr, default) or `file`
//! - `TCPWIRE_LOG_FILE`: log file path when the handler is `file`, default `log.txt`
//! - `LOG_FORMAT=json`: emit JSON lines instead of human-readable text
//! - `RUST_LOG`: full filter directive, overrides `TCPWIRE_LOG`

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::Subscriber;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt};

pub const DEFAULT_LOG_FILE: &str = "log.txt";

const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid logging configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install global subscriber: {0}")]
    Init(String),
}

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogHandler {
    Console,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub handler: LogHandler,
    pub json: bool,
    /// Raw `RUST_LOG` directive; replaces the level-based filter when set.
    pub filter_override: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            handler: LogHandler::Console,
            json: false,
            filter_override: None,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Result<Self, LoggingError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LoggingError> {
        let level = match lookup("TCPWIRE_LOG") {
            Some(raw) => normalize_level(&raw)?,
            None => "info".to_string(),
        };

        let handler = match lookup("TCPWIRE_LOG_HANDLER").as_deref() {
            None | Some("console") => LogHandler::Console,
            Some("file") => LogHandler::File(
                lookup("TCPWIRE_LOG_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
            ),
            Some(other) => {
                return Err(LoggingError::InvalidConfiguration(format!(
                    "unknown log handler '{other}' (expected 'console' or 'file')"
                )));
            }
        };

        Ok(Self {
            level,
            handler,
            json: lookup("LOG_FORMAT").as_deref() == Some("json"),
            filter_override: lookup("RUST_LOG").filter(|s| !s.is_empty()),
        })
    }

    pub fn with_level(mut self, level: &str) -> Result<Self, LoggingError> {
        self.level = normalize_level(level)?;
        Ok(self)
    }

    pub fn with_handler(mut self, handler: LogHandler) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        let directive = match &self.filter_override {
            Some(directive) => directive.clone(),
            None => format!("tcpwire={0},tcpwire_demo={0}", self.level),
        };
        EnvFilter::try_new(&directive)
            .map_err(|e| LoggingError::InvalidConfiguration(format!("{directive}: {e}")))
    }
}

fn normalize_level(raw: &str) -> Result<String, LoggingError> {
    let level = raw.trim().to_ascii_lowercase();
    let level = if level == "warning" { "warn".to_string() } else { level };
    if LEVELS.contains(&level.as_str()) {
        Ok(level)
    } else {
        Err(LoggingError::InvalidConfiguration(format!(
            "unknown log level '{raw}'"
        )))
    }
}

/// Build a subscriber for `config` without installing it.
pub fn build_subscriber(
    config: &LogConfig,
) -> Result<Box<dyn Subscriber + Send + Sync>, LoggingError> {
    let filter = config.env_filter()?;

    let (writer, ansi) = match &config.handler {
        LogHandler::Console => (BoxMakeWriter::new(std::io::stderr), true),
        LogHandler::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
    };

    let registry = tracing_subscriber::registry().with(filter);
    let layer = if config.json {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer().with_ansi(ansi).with_writer(writer).boxed()
    };
    Ok(Box::new(registry.with(layer)))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let subscriber = build_subscriber(config)?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| LoggingError::Init(e.to_string()))
}
