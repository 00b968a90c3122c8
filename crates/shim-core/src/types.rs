use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EXIT_SUCCESS;

// ---------------------------------------------------------------------------
// WindowSize
// ---------------------------------------------------------------------------

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// A zero row or column count means the size is unknown.
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

// ---------------------------------------------------------------------------
// SignalEvent
// ---------------------------------------------------------------------------

/// Something observed on the host that must be replayed against the remote
/// process: either a plain OS signal or a terminal resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalEvent {
    Signal { signal: i32 },
    Resize { rows: u16, cols: u16 },
}

impl SignalEvent {
    pub fn signal(signal: i32) -> Self {
        SignalEvent::Signal { signal }
    }

    pub fn resize(size: WindowSize) -> Self {
        SignalEvent::Resize {
            rows: size.rows,
            cols: size.cols,
        }
    }

    pub fn is_resize(&self) -> bool {
        matches!(self, SignalEvent::Resize { .. })
    }
}

impl fmt::Display for SignalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalEvent::Signal { signal } => write!(f, "signal {signal}"),
            SignalEvent::Resize { rows, cols } => write!(f, "resize {cols}x{rows}"),
        }
    }
}

// ---------------------------------------------------------------------------
// StreamKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExitStatus
// ---------------------------------------------------------------------------

/// Exit code of the remote process as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
}

impl ExitStatus {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// The status this process should exit with.
    ///
    /// With `proxy_exit_code` the remote code is returned verbatim; without
    /// it a successful wait always yields [`EXIT_SUCCESS`].
    pub fn process_exit_code(&self, proxy_exit_code: bool) -> i32 {
        if proxy_exit_code && self.code != 0 {
            self.code
        } else {
            EXIT_SUCCESS
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
