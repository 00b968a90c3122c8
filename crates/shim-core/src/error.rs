use std::time::Duration;

use thiserror::Error;

/// Process exit status reported when the session succeeded.
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit status reported for every fatal session error.
pub const EXIT_FAILURE: i32 = 1;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// AgentError
// ---------------------------------------------------------------------------

/// Errors returned by an agent client.
///
/// `Connection` is only produced while connecting; the remaining variants
/// can surface from any call on an established client.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent connection failed: {0}")]
    Connection(String),

    #[error("agent unavailable: {0}")]
    Unavailable(String),

    #[error("agent call timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("agent stream closed")]
    StreamClosed,

    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// ShimError
// ---------------------------------------------------------------------------

/// Fatal session errors. Every variant ends the session and maps to
/// [`EXIT_FAILURE`]; recoverable per-direction I/O errors and signal delivery
/// failures never reach this type.
#[derive(Debug, Error)]
pub enum ShimError {
    /// A required setting was missing or malformed. Raised before any
    /// connection attempt.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The agent socket was unreachable or the handshake failed.
    #[error("failed to connect to agent: {0}")]
    Connection(#[source] AgentError),

    /// A terminal was requested but raw mode could not be acquired.
    #[error("terminal error: {0}")]
    Terminal(String),

    /// The agent went away before the remote process was reaped.
    #[error("agent unavailable while waiting for process: {0}")]
    AgentUnavailable(String),

    /// The optional wait deadline elapsed. The remote process is left running.
    #[error("timed out after {0:?} waiting for process exit")]
    Timeout(Duration),

    /// Shutdown was forced (fatal signal or caller request) before the
    /// session completed.
    #[error("session cancelled by shutdown")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ShimError {
    /// Translate a failed `wait_exit` call into the session taxonomy.
    pub fn from_wait(err: AgentError) -> Self {
        match err {
            AgentError::Timeout(after) => ShimError::Timeout(after),
            other => ShimError::AgentUnavailable(other.to_string()),
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        EXIT_FAILURE
    }
}

impl From<ConfigError> for ShimError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation(msg) => ShimError::InvalidConfig(msg),
            other => ShimError::InvalidConfig(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
