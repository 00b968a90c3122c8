//! The shim session: everything between "connected to the agent" and
//! "remote process exited".
//!
//! - [`session`]: the orchestrator and the `run_session` entry used by the
//!   binary
//! - [`stdio`]: per-direction copy tasks behind a join barrier
//! - [`signals`]: host signal subscription and delivery to the agent
//! - [`terminal`]: raw mode acquisition and its scoped release
//! - [`shutdown`]: process-wide cancellation

pub mod session;
pub mod shutdown;
pub mod signals;
pub mod stdio;
pub mod terminal;

pub use session::{run_session, SessionContext, SessionDeps, SessionOutcome, ShimSession};
pub use shutdown::ShutdownSignal;
pub use signals::{SignalForwarder, SignalSender};
pub use stdio::{DirectionOutcome, LocalStdio, ProxyReport, StdioProxy};
pub use terminal::{HostTerminal, RawModeGuard, Terminal, TerminalError};
