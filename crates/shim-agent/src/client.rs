use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shim_core::{AgentError, ExitStatus, SignalEvent};

/// Host-to-remote byte stream (the remote process' stdin).
#[async_trait]
pub trait RemoteSink: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), AgentError>;

    /// Signal end-of-input to the remote process. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), AgentError>;
}

/// Remote-to-host byte stream (the remote process' stdout or stderr).
#[async_trait]
pub trait RemoteSource: Send {
    /// Next chunk of output, or `None` once the remote closed the stream.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, AgentError>;
}

/// The three stdio handles of one session.
pub struct IoStreams {
    pub stdin: Box<dyn RemoteSink>,
    pub stdout: Box<dyn RemoteSource>,
    pub stderr: Box<dyn RemoteSource>,
}

impl std::fmt::Debug for IoStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoStreams").finish_non_exhaustive()
    }
}

/// Connection to the agent, scoped to one (container, exec) pair.
///
/// Implementations multiplex every call over a single connection and
/// serialise frames internally, so callers need no lock.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Hand out the stdio stream handles. Only the first call succeeds.
    async fn open_io_streams(&self) -> Result<IoStreams, AgentError>;

    /// Best-effort delivery of a signal or resize to the remote process.
    async fn send_signal(&self, event: SignalEvent) -> Result<(), AgentError>;

    /// Block until the remote process exits.
    ///
    /// Fails with `Unavailable` if the connection drops first and with
    /// `Timeout` once `timeout` elapses. A timeout does not touch the remote
    /// process.
    async fn wait_exit(&self, timeout: Option<Duration>) -> Result<ExitStatus, AgentError>;
}

/// Establishes agent connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        container_id: &str,
        exec_id: &str,
    ) -> Result<Arc<dyn AgentClient>, AgentError>;
}
