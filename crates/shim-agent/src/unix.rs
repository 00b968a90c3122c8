use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shim_core::{AgentError, ExitStatus, SignalEvent, StreamKind};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{AgentClient, Connector, IoStreams, RemoteSink, RemoteSource};
use crate::protocol::{self, AgentFrame, ClientFrame};

/// How long the agent has to answer `hello`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const WRITE_QUEUE: usize = 256;
const OUTPUT_QUEUE: usize = 256;

type OutputItem = Result<Vec<u8>, AgentError>;

/// Resolve an agent address to a socket path.
///
/// Accepts `unix:///path` and bare paths; any other scheme is rejected.
pub fn socket_path(address: &str) -> Result<PathBuf, AgentError> {
    let address = address.trim();
    let path = match address.strip_prefix("unix://") {
        Some(rest) => rest,
        None if address.contains("://") => {
            return Err(AgentError::Connection(format!(
                "unsupported agent address {address:?}"
            )));
        }
        None => address,
    };
    if path.is_empty() {
        return Err(AgentError::Connection("empty agent socket path".into()));
    }
    Ok(PathBuf::from(path))
}

// ---------------------------------------------------------------------------
// Exit slot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExitState {
    Running,
    Exited(i32),
    Lost(String),
}

// ---------------------------------------------------------------------------
// UnixAgentClient
// ---------------------------------------------------------------------------

/// Agent client over a Unix socket.
///
/// A single writer task owns the write half and drains a bounded queue of
/// frames; a single reader task demultiplexes incoming frames into the
/// stdout/stderr queues and the exit slot.
pub struct UnixAgentClient {
    container_id: String,
    exec_id: String,
    writer: flume::Sender<ClientFrame>,
    outputs: Mutex<Option<(flume::Receiver<OutputItem>, flume::Receiver<OutputItem>)>>,
    exit: watch::Receiver<ExitState>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl UnixAgentClient {
    /// Connect and perform the `hello`/`ready` handshake.
    pub async fn connect(
        address: &str,
        container_id: &str,
        exec_id: &str,
        handshake_timeout: Duration,
    ) -> Result<Self, AgentError> {
        let path = socket_path(address)?;
        debug!(path = %path.display(), "connecting to agent");
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|e| AgentError::Connection(format!("{}: {e}", path.display())))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let hello = protocol::encode(&ClientFrame::Hello {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        })?;
        match tokio::time::timeout(
            handshake_timeout,
            handshake(&mut write_half, &mut lines, &hello),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(AgentError::Protocol(msg))) => return Err(AgentError::Connection(msg)),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(AgentError::Connection(format!(
                    "no handshake reply within {handshake_timeout:?}"
                )))
            }
        }

        let (writer, write_rx) = flume::bounded::<ClientFrame>(WRITE_QUEUE);
        let (stdout_tx, stdout_rx) = flume::bounded::<OutputItem>(OUTPUT_QUEUE);
        let (stderr_tx, stderr_rx) = flume::bounded::<OutputItem>(OUTPUT_QUEUE);
        let (exit_tx, exit) = watch::channel(ExitState::Running);

        let writer_task = tokio::spawn(write_loop(write_half, write_rx));
        let reader_task = tokio::spawn(read_loop(lines, stdout_tx, stderr_tx, exit_tx));

        info!(container = container_id, "exec-id" = exec_id, "connected to agent");
        Ok(Self {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
            writer,
            outputs: Mutex::new(Some((stdout_rx, stderr_rx))),
            exit,
            reader_task,
            writer_task,
        })
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), AgentError> {
        self.writer
            .send_async(frame)
            .await
            .map_err(|_| AgentError::Unavailable("agent connection closed".into()))
    }

    fn exit_state(&self) -> ExitState {
        self.exit.borrow().clone()
    }
}

#[async_trait]
impl AgentClient for UnixAgentClient {
    async fn open_io_streams(&self) -> Result<IoStreams, AgentError> {
        let taken = self
            .outputs
            .lock()
            .unwrap_or_else(|e| {
                warn!("stream lock was poisoned, recovering");
                e.into_inner()
            })
            .take();
        let (stdout, stderr) =
            taken.ok_or_else(|| AgentError::Protocol("io streams already opened".into()))?;
        Ok(IoStreams {
            stdin: Box::new(StdinSink {
                writer: self.writer.clone(),
                closed: false,
            }),
            stdout: Box::new(OutputSource { rx: stdout }),
            stderr: Box::new(OutputSource { rx: stderr }),
        })
    }

    async fn send_signal(&self, event: SignalEvent) -> Result<(), AgentError> {
        debug!(%event, "forwarding to agent");
        self.send(ClientFrame::from(event)).await
    }

    async fn wait_exit(&self, timeout: Option<Duration>) -> Result<ExitStatus, AgentError> {
        if self.exit_state() == ExitState::Running {
            self.send(ClientFrame::Wait).await?;
        }
        let mut rx = self.exit.clone();
        let wait = async move {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    ExitState::Exited(code) => return Ok(ExitStatus::new(code)),
                    ExitState::Lost(reason) => return Err(AgentError::Unavailable(reason)),
                    ExitState::Running => {}
                }
                if rx.changed().await.is_err() {
                    return Err(AgentError::Unavailable("agent connection closed".into()));
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| AgentError::Timeout(limit))?,
            None => wait.await,
        }
    }
}

async fn handshake(
    write_half: &mut OwnedWriteHalf,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    hello: &[u8],
) -> Result<(), AgentError> {
    write_half
        .write_all(hello)
        .await
        .map_err(|e| AgentError::Connection(format!("send hello: {e}")))?;
    match lines.next_line().await {
        Ok(Some(line)) => match protocol::decode::<AgentFrame>(&line)? {
            AgentFrame::Ready => Ok(()),
            AgentFrame::Error { message } => Err(AgentError::Connection(format!(
                "agent rejected session: {message}"
            ))),
            other => Err(AgentError::Connection(format!(
                "unexpected handshake reply: {other:?}"
            ))),
        },
        Ok(None) => Err(AgentError::Connection(
            "agent closed connection during handshake".into(),
        )),
        Err(e) => Err(AgentError::Connection(format!("read handshake: {e}"))),
    }
}

impl Drop for UnixAgentClient {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl std::fmt::Debug for UnixAgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixAgentClient")
            .field("container_id", &self.container_id)
            .field("exec_id", &self.exec_id)
            .field("exit", &self.exit_state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection tasks
// ---------------------------------------------------------------------------

async fn write_loop(mut write_half: OwnedWriteHalf, rx: flume::Receiver<ClientFrame>) {
    while let Ok(frame) = rx.recv_async().await {
        let line = match protocol::encode(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "dropping unencodable frame");
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&line).await {
            warn!(error = %e, "agent write failed");
            break;
        }
    }
    let _ = write_half.shutdown().await;
    debug!("agent writer stopped");
}

async fn read_loop(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    stdout_tx: flume::Sender<OutputItem>,
    stderr_tx: flume::Sender<OutputItem>,
    exit_tx: watch::Sender<ExitState>,
) {
    let mut stdout_tx = Some(stdout_tx);
    let mut stderr_tx = Some(stderr_tx);

    let reason = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break "agent connection closed".to_string(),
            Err(e) => break format!("agent read failed: {e}"),
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame = match protocol::decode::<AgentFrame>(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "ignoring malformed agent frame");
                continue;
            }
        };
        match frame {
            AgentFrame::Stdout { data_b64 } => forward(&mut stdout_tx, &data_b64).await,
            AgentFrame::Stderr { data_b64 } => forward(&mut stderr_tx, &data_b64).await,
            AgentFrame::Eof { stream } => match stream {
                StreamKind::Stdout => stdout_tx = None,
                StreamKind::Stderr => stderr_tx = None,
                StreamKind::Stdin => warn!("agent sent eof for stdin"),
            },
            AgentFrame::Exit { code } => {
                debug!(code, "remote process exited");
                exit_tx.send_replace(ExitState::Exited(code));
            }
            AgentFrame::Error { message } => warn!(%message, "agent reported error"),
            AgentFrame::Ready => debug!("ignoring duplicate ready"),
        }
    };

    debug!(%reason, "agent reader stopped");
    for tx in [stdout_tx.take(), stderr_tx.take()].into_iter().flatten() {
        let _ = tx
            .send_async(Err(AgentError::Unavailable(reason.clone())))
            .await;
    }
    exit_tx.send_if_modified(|state| {
        if *state == ExitState::Running {
            *state = ExitState::Lost(reason.clone());
            true
        } else {
            false
        }
    });
}

async fn forward(tx: &mut Option<flume::Sender<OutputItem>>, data_b64: &str) {
    let Some(sender) = tx.as_ref() else {
        warn!("output after eof, dropping");
        return;
    };
    if sender.is_disconnected() {
        return;
    }
    let item = protocol::decode_data(data_b64);
    if sender.send_async(item).await.is_err() {
        debug!("output stream has no reader, discarding");
    }
}

// ---------------------------------------------------------------------------
// Stream handles
// ---------------------------------------------------------------------------

struct StdinSink {
    writer: flume::Sender<ClientFrame>,
    closed: bool,
}

#[async_trait]
impl RemoteSink for StdinSink {
    async fn write(&mut self, data: &[u8]) -> Result<(), AgentError> {
        if self.closed {
            return Err(AgentError::StreamClosed);
        }
        self.writer
            .send_async(ClientFrame::stdin(data))
            .await
            .map_err(|_| AgentError::Unavailable("agent connection closed".into()))
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.writer
            .send_async(ClientFrame::CloseStdin)
            .await
            .map_err(|_| AgentError::Unavailable("agent connection closed".into()))
    }
}

struct OutputSource {
    rx: flume::Receiver<OutputItem>,
}

#[async_trait]
impl RemoteSource for OutputSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, AgentError> {
        match self.rx.recv_async().await {
            Ok(item) => item.map(Some),
            Err(_) => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// UnixConnector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UnixConnector {
    handshake_timeout: Duration,
}

impl UnixConnector {
    pub fn new() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Default for UnixConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for UnixConnector {
    async fn connect(
        &self,
        address: &str,
        container_id: &str,
        exec_id: &str,
    ) -> Result<Arc<dyn AgentClient>, AgentError> {
        let client =
            UnixAgentClient::connect(address, container_id, exec_id, self.handshake_timeout)
                .await?;
        Ok(Arc::new(client))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
