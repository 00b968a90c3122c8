#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use shim_agent::{AgentClient, Connector, IoStreams, RemoteSink, RemoteSource};
use shim_core::{AgentError, ExitStatus, SignalEvent, StreamKind, WindowSize};
use shim_session::{LocalStdio, SessionDeps, Terminal, TerminalError};
use tokio::io::AsyncWrite;

// ---------------------------------------------------------------------------
// Call log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    OpenStreams,
    StdinWrite(Vec<u8>),
    StdinClose,
    HandleDropped(StreamKind),
    Signal(SignalEvent),
    Wait,
}

#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn stdin_bytes(&self) -> Vec<u8> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::StdinWrite(data) => Some(data),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Fake agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ExitBehavior {
    Code(i32),
    Unavailable,
    Hang,
}

/// Scripted remote process. `wait_exit` refuses to answer until every
/// stream handle has been dropped, i.e. every copy task has finished.
pub struct FakeAgent {
    pub log: CallLog,
    stdout: Mutex<Option<VecDeque<Vec<u8>>>>,
    stderr: Mutex<Option<VecDeque<Vec<u8>>>>,
    stdout_error: Option<String>,
    signals_fail: bool,
    exit: ExitBehavior,
    dropped: Arc<AtomicUsize>,
}

impl FakeAgent {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            stdout: Mutex::new(Some(VecDeque::new())),
            stderr: Mutex::new(Some(VecDeque::new())),
            stdout_error: None,
            signals_fail: false,
            exit: ExitBehavior::Code(0),
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_stdout(self, chunks: &[&[u8]]) -> Self {
        *self.stdout.lock().unwrap() = Some(chunks.iter().map(|c| c.to_vec()).collect());
        self
    }

    pub fn with_stderr(self, chunks: &[&[u8]]) -> Self {
        *self.stderr.lock().unwrap() = Some(chunks.iter().map(|c| c.to_vec()).collect());
        self
    }

    /// Remote stdout fails with `Unavailable` after its scripted chunks.
    pub fn with_stdout_error(mut self, message: &str) -> Self {
        self.stdout_error = Some(message.to_string());
        self
    }

    /// Every `send_signal` is recorded, then rejected.
    pub fn rejecting_signals(mut self) -> Self {
        self.signals_fail = true;
        self
    }

    pub fn exiting(mut self, exit: ExitBehavior) -> Self {
        self.exit = exit;
        self
    }

    fn source(&self, kind: StreamKind) -> FakeSource {
        let slot = match kind {
            StreamKind::Stderr => &self.stderr,
            _ => &self.stdout,
        };
        FakeSource {
            kind,
            chunks: slot.lock().unwrap().take().unwrap_or_default(),
            error: match kind {
                StreamKind::Stdout => self.stdout_error.clone(),
                _ => None,
            },
            log: self.log.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn open_io_streams(&self) -> Result<IoStreams, AgentError> {
        self.log.push(Call::OpenStreams);
        Ok(IoStreams {
            stdin: Box::new(FakeSink {
                log: self.log.clone(),
                closed: false,
                dropped: Arc::clone(&self.dropped),
            }),
            stdout: Box::new(self.source(StreamKind::Stdout)),
            stderr: Box::new(self.source(StreamKind::Stderr)),
        })
    }

    async fn send_signal(&self, event: SignalEvent) -> Result<(), AgentError> {
        self.log.push(Call::Signal(event));
        if self.signals_fail {
            return Err(AgentError::Protocol("signal rejected".into()));
        }
        Ok(())
    }

    async fn wait_exit(&self, timeout: Option<Duration>) -> Result<ExitStatus, AgentError> {
        self.log.push(Call::Wait);
        let dropped = self.dropped.load(Ordering::SeqCst);
        if dropped < 3 {
            return Err(AgentError::Protocol(format!(
                "wait issued with {} stream handles still live",
                3 - dropped
            )));
        }
        match &self.exit {
            ExitBehavior::Code(code) => Ok(ExitStatus::new(*code)),
            ExitBehavior::Unavailable => {
                Err(AgentError::Unavailable("agent connection closed".into()))
            }
            ExitBehavior::Hang => match timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    Err(AgentError::Timeout(limit))
                }
                None => std::future::pending().await,
            },
        }
    }
}

struct FakeSink {
    log: CallLog,
    closed: bool,
    dropped: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteSink for FakeSink {
    async fn write(&mut self, data: &[u8]) -> Result<(), AgentError> {
        if self.closed {
            return Err(AgentError::StreamClosed);
        }
        self.log.push(Call::StdinWrite(data.to_vec()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        if !std::mem::replace(&mut self.closed, true) {
            self.log.push(Call::StdinClose);
        }
        Ok(())
    }
}

impl Drop for FakeSink {
    fn drop(&mut self) {
        self.log.push(Call::HandleDropped(StreamKind::Stdin));
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeSource {
    kind: StreamKind,
    chunks: VecDeque<Vec<u8>>,
    error: Option<String>,
    log: CallLog,
    dropped: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteSource for FakeSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, AgentError> {
        tokio::task::yield_now().await;
        if let Some(chunk) = self.chunks.pop_front() {
            return Ok(Some(chunk));
        }
        match self.error.take() {
            Some(message) => Err(AgentError::Unavailable(message)),
            None => Ok(None),
        }
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.log.push(Call::HandleDropped(self.kind));
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Fake connector
// ---------------------------------------------------------------------------

pub struct FakeConnector {
    agent: Mutex<Option<Arc<FakeAgent>>>,
    refuse: bool,
    pub attempts: AtomicUsize,
}

impl FakeConnector {
    pub fn serving(agent: FakeAgent) -> Arc<Self> {
        Arc::new(Self {
            agent: Mutex::new(Some(Arc::new(agent))),
            refuse: false,
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            agent: Mutex::new(None),
            refuse: true,
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _address: &str,
        _container_id: &str,
        _exec_id: &str,
    ) -> Result<Arc<dyn AgentClient>, AgentError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(AgentError::Connection("connection refused".into()));
        }
        let agent = self
            .agent
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AgentError::Connection("already connected".into()))?;
        agent.log.push(Call::Connect);
        Ok(agent)
    }
}

// ---------------------------------------------------------------------------
// Fake terminal
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeTerminal {
    pub tty: bool,
    pub size: Option<WindowSize>,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl FakeTerminal {
    pub fn tty(size: Option<WindowSize>) -> Arc<Self> {
        Arc::new(Self {
            tty: true,
            size,
            ..Default::default()
        })
    }

    pub fn pipe() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl Terminal for FakeTerminal {
    fn is_terminal(&self) -> bool {
        self.tty
    }

    fn enter_raw(&self) -> Result<(), TerminalError> {
        if !self.tty {
            return Err(TerminalError::NotATerminal);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn restore(&self) -> Result<(), TerminalError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn window_size(&self) -> Option<WindowSize> {
        self.size
    }
}

// ---------------------------------------------------------------------------
// Local stdio
// ---------------------------------------------------------------------------

/// In-memory writer whose contents stay readable after it is moved.
#[derive(Debug, Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl AsyncWrite for Capture {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Every write fails, like a closed pipe.
#[derive(Debug, Default)]
pub struct BrokenPipe;

impl AsyncWrite for BrokenPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub struct Stdio {
    pub local: LocalStdio,
    pub stdout: Capture,
    pub stderr: Capture,
}

/// Local stdio with `input` on stdin and captured outputs.
pub fn stdio_with_input(input: &'static [u8]) -> Stdio {
    let stdout = Capture::default();
    let stderr = Capture::default();
    Stdio {
        local: LocalStdio {
            stdin: Box::new(input),
            stdout: Box::new(stdout.clone()),
            stderr: Box::new(stderr.clone()),
        },
        stdout,
        stderr,
    }
}

pub fn deps(
    connector: Arc<FakeConnector>,
    terminal: Arc<FakeTerminal>,
    stdio: LocalStdio,
) -> SessionDeps {
    SessionDeps {
        connector,
        terminal,
        stdio,
    }
}
