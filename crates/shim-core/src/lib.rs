//! Core types shared by every sandbox-shim crate.
//!
//! The shim supervises exactly one container process (or one exec inside a
//! container) running behind a sandbox agent. This crate holds the pieces
//! that every other crate needs to agree on:
//! - **Config**: `ShimConfig`, its TOML overlay and the pre-flight checks
//! - **Errors**: the fatal/non-fatal error taxonomy and exit-code mapping
//! - **Types**: signal events, window sizes, stdio stream kinds, exit status
//! - **State**: the session lifecycle state machine

pub mod config;
pub mod error;
pub mod state;
pub mod types;

pub use config::{LogFormat, ShimConfig};
pub use error::{AgentError, ConfigError, ShimError, EXIT_FAILURE, EXIT_SUCCESS};
pub use types::{ExitStatus, SignalEvent, StreamKind, WindowSize};

/// Name the shim announces itself with in logs and traces.
pub const SHIM_NAME: &str = "sandbox-shim";
