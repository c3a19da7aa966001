//! Structured logging via tracing, JSON (production) or plaintext
//! (development), with a redacting writer so tokens and passwords never
//! reach log output verbatim.
//!
//! Filter resolution: `PORTCULLIS_LOG` first, then `RUST_LOG`, then a
//! default built from the standard targets (`gateway`, `ws`, `bridge`,
//! `auth`, `config`).

pub mod redact;

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::logging::redact::RedactingMakeWriter;

static INIT_GUARD: OnceLock<()> = OnceLock::new();

pub const LOG_ENV_VAR: &str = "PORTCULLIS_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Plaintext,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::DEBUG,
        }
    }

    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// `PORTCULLIS_LOG` first, then `RUST_LOG`, then the default level applied
/// to the standard targets.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var(LOG_ENV_VAR) {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    let level = default_level.as_str().to_lowercase();
    let default_filter = format!(
        "{level},gateway={level},ws={level},bridge={level},auth={level},config={level}"
    );
    Ok(EnvFilter::try_new(default_filter)?)
}

/// Initialize the global subscriber. Call once at startup; subsequent calls
/// error.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }
    init_logging_inner(config)
}

fn init_logging_inner(config: LogConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(config.default_level)?;
    let timer = UtcTime::rfc_3339();

    macro_rules! install {
        ($writer:expr) => {{
            let writer = RedactingMakeWriter::new($writer);
            match config.format {
                LogFormat::Json => {
                    let layer = tracing_subscriber::fmt::layer()
                        .json()
                        .with_timer(timer)
                        .with_target(true)
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_writer(writer)
                        .with_filter(filter);
                    tracing_subscriber::registry().with(layer).try_init()?;
                }
                LogFormat::Plaintext => {
                    let layer = tracing_subscriber::fmt::layer()
                        .with_timer(timer)
                        .with_target(true)
                        .with_thread_ids(false)
                        .with_thread_names(false)
                        .with_file(false)
                        .with_line_number(false)
                        .with_writer(writer)
                        .with_filter(filter);
                    tracing_subscriber::registry().with(layer).try_init()?;
                }
            }
        }};
    }

    match &config.output {
        LogOutput::Stdout => install!(io::stdout),
        LogOutput::Stderr => install!(io::stderr),
        LogOutput::File(path) => {
            let file = File::create(path)?;
            install!(file)
        }
    }
    Ok(())
}

/// Test-friendly initialization; safe to call repeatedly.
pub fn init_test_logging() {
    let _ = init_logging_inner(LogConfig::development());
}

/// Log target constants used across the crate.
pub mod targets {
    pub const GATEWAY: &str = "gateway";
    pub const WS: &str = "ws";
    pub const BRIDGE: &str = "bridge";
    pub const AUTH: &str = "auth";
    pub const CONFIG: &str = "config";
}
