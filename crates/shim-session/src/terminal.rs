use std::io::IsTerminal;
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex};

use nix::sys::termios::{self, SetArg, Termios};
use shim_core::WindowSize;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("standard input is not a terminal")]
    NotATerminal,

    #[error("terminal i/o failed: {0}")]
    Io(String),
}

/// Host terminal attached to the shim's standard input.
pub trait Terminal: Send + Sync {
    fn is_terminal(&self) -> bool;

    /// Switch to raw mode, saving the current attributes.
    fn enter_raw(&self) -> Result<(), TerminalError>;

    /// Put back the attributes saved by `enter_raw`. No-op when nothing is
    /// saved.
    fn restore(&self) -> Result<(), TerminalError>;

    /// Current size, `None` if it cannot be queried.
    fn window_size(&self) -> Option<WindowSize>;
}

// ---------------------------------------------------------------------------
// HostTerminal
// ---------------------------------------------------------------------------

/// The process' real stdin.
#[derive(Default)]
pub struct HostTerminal {
    saved: Mutex<Option<Termios>>,
}

impl HostTerminal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Terminal for HostTerminal {
    fn is_terminal(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    fn enter_raw(&self) -> Result<(), TerminalError> {
        if !self.is_terminal() {
            return Err(TerminalError::NotATerminal);
        }
        let stdin = std::io::stdin();
        let original =
            termios::tcgetattr(stdin.as_fd()).map_err(|e| TerminalError::Io(e.to_string()))?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)
            .map_err(|e| TerminalError::Io(e.to_string()))?;

        *self.saved.lock().unwrap_or_else(|e| {
            warn!("terminal state lock was poisoned, recovering");
            e.into_inner()
        }) = Some(original);
        debug!("terminal switched to raw mode");
        Ok(())
    }

    fn restore(&self) -> Result<(), TerminalError> {
        let saved = self
            .saved
            .lock()
            .unwrap_or_else(|e| {
                warn!("terminal state lock was poisoned, recovering");
                e.into_inner()
            })
            .take();
        let Some(original) = saved else {
            return Ok(());
        };
        termios::tcsetattr(std::io::stdin().as_fd(), SetArg::TCSANOW, &original)
            .map_err(|e| TerminalError::Io(e.to_string()))?;
        debug!("terminal attributes restored");
        Ok(())
    }

    fn window_size(&self) -> Option<WindowSize> {
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCGWINSZ only writes into the winsize struct we own, and
        // STDIN_FILENO stays open for the life of the process.
        let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) };
        if rc != 0 {
            return None;
        }
        let size = WindowSize::new(ws.ws_row, ws.ws_col);
        (!size.is_empty()).then_some(size)
    }
}

impl std::fmt::Debug for HostTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let raw = self
            .saved
            .lock()
            .map(|s| s.is_some())
            .unwrap_or(false);
        f.debug_struct("HostTerminal").field("raw", &raw).finish()
    }
}

// ---------------------------------------------------------------------------
// RawModeGuard
// ---------------------------------------------------------------------------

/// Raw mode held for a scope. The saved attributes are restored exactly
/// once: by [`release`](Self::release) or, failing that, on drop (which also
/// covers unwinding).
pub struct RawModeGuard {
    terminal: Arc<dyn Terminal>,
    active: bool,
}

impl RawModeGuard {
    pub fn acquire(terminal: Arc<dyn Terminal>) -> Result<Self, TerminalError> {
        terminal.enter_raw()?;
        Ok(Self {
            terminal,
            active: true,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn release(&mut self) -> Result<(), TerminalError> {
        if !std::mem::replace(&mut self.active, false) {
            return Ok(());
        }
        self.terminal.restore()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to restore terminal");
        }
    }
}

impl std::fmt::Debug for RawModeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawModeGuard")
            .field("active", &self.active)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
