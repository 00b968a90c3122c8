use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use shim_core::{LogFormat, ShimConfig, SHIM_NAME};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

use crate::tracer::TRACE_TARGET;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("cannot open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where log records end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Discard,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub target: LogTarget,
    /// Let exported spans through regardless of `level`.
    pub trace: bool,
}

impl LogSettings {
    pub fn from_config(cfg: &ShimConfig) -> Self {
        let level = if cfg.debug {
            "debug".to_string()
        } else {
            cfg.log_level.clone()
        };
        Self {
            level,
            format: cfg.log_format,
            target: cfg
                .log_file
                .clone()
                .map(LogTarget::File)
                .unwrap_or(LogTarget::Discard),
            trace: cfg.trace,
        }
    }
}

/// Parse a level name such as `warn` or `DEBUG`.
pub fn parse_level(level: &str) -> Result<Level, LoggingError> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|_| LoggingError::InvalidLevel(level.to_string()))
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set. With `trace` the
/// span export target is always enabled at `info`. Safe to call more than
/// once (e.g. in tests): later calls are no-ops.
pub fn init_logging(settings: &LogSettings) -> Result<(), LoggingError> {
    let level = parse_level(&settings.level)?;
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    if settings.trace {
        match format!("{TRACE_TARGET}=info").parse::<Directive>() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => tracing::warn!(error = %e, "cannot enable span export"),
        }
    }

    let writer = match &settings.target {
        LogTarget::Discard => BoxMakeWriter::new(std::io::sink),
        LogTarget::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true);

    match settings.format {
        LogFormat::Text => builder.try_init().ok(),
        LogFormat::Json => builder.json().try_init().ok(),
    };

    Ok(())
}

/// Root span carrying the standard fields every shim log line needs.
///
/// Enter it (or instrument the session future with it) for the lifetime of
/// the session.
pub fn log_context(cfg: &ShimConfig) -> tracing::Span {
    tracing::info_span!(
        "shim",
        name = SHIM_NAME,
        source = "shim",
        container = %cfg.container_id,
        "exec-id" = %cfg.exec_id,
        pid = std::process::id(),
    )
}

/// Log the effective settings once at startup.
pub fn announce(cfg: &ShimConfig, version: &str) {
    tracing::info!(
        version,
        debug = cfg.is_debug(),
        "log-level" = %cfg.log_level,
        "agent-socket" = %cfg.agent_address,
        terminal = cfg.terminal,
        "proxy-exit-code" = cfg.proxy_exit_code,
        tracing = cfg.trace,
        "announce"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
