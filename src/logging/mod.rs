//! Logging system initialization
//!
//! Uses the tracing ecosystem for structured logging with support for:
//! - Environment variable override (ALARMCORE_LOG)
//! - File output with daily rotation
//! - Console output in pretty, compact or JSON form
//! - In-memory log buffer for inspecting recent records

pub mod layers;

pub use layers::{LogBuffer, LogBufferLayer, LogEntry};

use std::path::PathBuf;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    /// Unknown names fall back to `Pretty`
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Parse log level from string
pub fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("alarmcore")
        .join("logs")
}

/// Records kept for [`LogBuffer`] readers
const DEFAULT_LOG_BUFFER_SIZE: usize = 200;

/// Initialize the global subscriber.
///
/// Returns a `LogBuffer` handle over the most recent records.
///
/// # Environment Variables
/// - `ALARMCORE_LOG`: Override the filter (e.g. "alarmcore=debug,alarmcore::scheduler=trace")
pub fn init_logging(config: &LoggingConfig) -> LogBuffer {
    let level = parse_level(&config.level);
    let format = LogFormat::parse(&config.format);

    let env_filter = EnvFilter::try_from_env("ALARMCORE_LOG").unwrap_or_else(|_| {
        EnvFilter::new(format!("alarmcore={}", level.as_str().to_lowercase()))
    });

    let console_layer = console_layer(config, format);

    let file_layer = if config.file_output {
        let log_dir = config.file_path.clone().unwrap_or_else(default_log_dir);

        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Warning: Failed to create log directory {:?}: {}", log_dir, e);
            None
        } else {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "alarmcore.log");

            let file_layer = fmt::layer()
                .with_writer(file_appender)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE);

            Some(file_layer.boxed())
        }
    } else {
        None
    };

    let (log_buffer_layer, log_buffer) = LogBufferLayer::new(DEFAULT_LOG_BUFFER_SIZE);

    // A second init (tests, embedding) keeps the first subscriber.
    if let Err(e) = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(log_buffer_layer)
        .with(env_filter)
        .try_init()
    {
        eprintln!("Warning: Logging already initialized: {}", e);
    }

    tracing::info!("Logging initialized");
    tracing::debug!(
        level = %level,
        format = ?format,
        file_output = config.file_output,
        "Logging configuration"
    );

    log_buffer
}

fn console_layer(config: &LoggingConfig, format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_file(config.file_line)
        .with_line_number(config.file_line);

    match (format, config.timestamps) {
        (LogFormat::Json, true) => layer.json().boxed(),
        (LogFormat::Json, false) => layer.json().without_time().boxed(),
        (LogFormat::Compact, true) => layer.compact().boxed(),
        (LogFormat::Compact, false) => layer.compact().without_time().boxed(),
        (LogFormat::Pretty, true) => layer.with_ansi(true).boxed(),
        (LogFormat::Pretty, false) => layer.with_ansi(true).without_time().boxed(),
    }
}

/// A subscriber that only feeds a fresh [`LogBuffer`], for scoped capture with
/// `tracing::subscriber::with_default`
pub fn buffer_subscriber(max_size: usize) -> (impl tracing::Subscriber + Send + Sync, LogBuffer) {
    let (layer, buffer) = LogBufferLayer::new(max_size);
    (tracing_subscriber::registry().with(layer), buffer)
}
