use shim_agent::{IoStreams, RemoteSink, RemoteSource};
use shim_core::StreamKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownSignal;

/// Read buffer for the host-to-remote direction.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

pub type LocalReader = Box<dyn AsyncRead + Send + Unpin>;
pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The shim's own standard descriptors.
pub struct LocalStdio {
    pub stdin: LocalReader,
    pub stdout: LocalWriter,
    pub stderr: LocalWriter,
}

impl LocalStdio {
    pub fn host() -> Self {
        Self {
            stdin: Box::new(tokio::io::stdin()),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
        }
    }
}

impl std::fmt::Debug for LocalStdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStdio").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// How one copy direction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectionOutcome {
    /// Source reached end-of-stream and the destination was closed.
    Completed { bytes: u64 },
    Failed { bytes: u64, error: String },
    /// Stopped by the proxy or by shutdown before the source ended.
    Cancelled { bytes: u64 },
}

impl DirectionOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            DirectionOutcome::Completed { bytes }
            | DirectionOutcome::Failed { bytes, .. }
            | DirectionOutcome::Cancelled { bytes } => *bytes,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DirectionOutcome::Completed { .. })
    }
}

/// Per-direction outcomes once the join barrier has cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyReport {
    outcomes: Vec<(StreamKind, DirectionOutcome)>,
}

impl ProxyReport {
    fn record(&mut self, kind: StreamKind, outcome: DirectionOutcome) {
        self.outcomes.push((kind, outcome));
    }

    pub fn get(&self, kind: StreamKind) -> Option<&DirectionOutcome> {
        self.outcomes
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, outcome)| outcome)
    }

    pub fn directions(&self) -> impl Iterator<Item = StreamKind> + '_ {
        self.outcomes.iter().map(|(k, _)| *k)
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DirectionOutcome::Failed { .. }))
            .count()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// StdioProxy
// ---------------------------------------------------------------------------

/// Copies bytes between the local descriptors and the remote streams, one
/// task per direction, and returns only once every direction has ended.
///
/// With a terminal the remote side merges stderr into stdout, so the stderr
/// direction is not started. A failure in one direction never stops the
/// others. Once all output directions are done a still-running stdin copy is
/// cancelled, so the barrier always clears after the remote closes its
/// output.
#[derive(Debug, Clone)]
pub struct StdioProxy {
    terminal: bool,
    shutdown: ShutdownSignal,
}

impl StdioProxy {
    pub fn new(terminal: bool, shutdown: ShutdownSignal) -> Self {
        Self { terminal, shutdown }
    }

    pub async fn run(&self, local: LocalStdio, remote: IoStreams) -> ProxyReport {
        let LocalStdio {
            stdin,
            stdout,
            stderr,
        } = local;
        let IoStreams {
            stdin: remote_stdin,
            stdout: remote_stdout,
            stderr: remote_stderr,
        } = remote;

        let (stop_stdin, stdin_stopped) = watch::channel(false);
        let stdin_task = tokio::spawn(copy_to_remote(
            stdin,
            remote_stdin,
            stdin_stopped,
            self.shutdown.clone(),
        ));

        let mut outputs: Vec<(StreamKind, JoinHandle<DirectionOutcome>)> = vec![(
            StreamKind::Stdout,
            tokio::spawn(copy_to_host(
                StreamKind::Stdout,
                remote_stdout,
                stdout,
                self.shutdown.clone(),
            )),
        )];
        if self.terminal {
            // Nothing reads this handle; releasing it lets the client discard
            // stray stderr frames instead of queueing them.
            drop(remote_stderr);
            drop(stderr);
        } else {
            outputs.push((
                StreamKind::Stderr,
                tokio::spawn(copy_to_host(
                    StreamKind::Stderr,
                    remote_stderr,
                    stderr,
                    self.shutdown.clone(),
                )),
            ));
        }

        let mut report = ProxyReport::default();
        for (kind, task) in outputs {
            report.record(kind, joined(kind, task.await));
        }

        let _ = stop_stdin.send(true);
        report.record(StreamKind::Stdin, joined(StreamKind::Stdin, stdin_task.await));

        info!(
            directions = report.len(),
            failures = report.failures(),
            "stdio drained"
        );
        report
    }
}

fn joined(
    kind: StreamKind,
    result: Result<DirectionOutcome, tokio::task::JoinError>,
) -> DirectionOutcome {
    match result {
        Ok(outcome) => {
            debug!(stream = %kind, ?outcome, "copy direction finished");
            outcome
        }
        Err(e) => {
            warn!(stream = %kind, error = %e, "copy task did not finish");
            DirectionOutcome::Failed {
                bytes: 0,
                error: e.to_string(),
            }
        }
    }
}

async fn copy_to_remote(
    mut src: LocalReader,
    mut sink: Box<dyn RemoteSink>,
    mut stop: watch::Receiver<bool>,
    shutdown: ShutdownSignal,
) -> DirectionOutcome {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes = 0u64;
    loop {
        let read = tokio::select! {
            biased;
            Ok(()) = stop.changed() => {
                let _ = sink.close().await;
                return DirectionOutcome::Cancelled { bytes };
            }
            _ = shutdown.cancelled() => {
                let _ = sink.close().await;
                return DirectionOutcome::Cancelled { bytes };
            }
            read = src.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(stream = "stdin", error = %e, "local read failed");
                let _ = sink.close().await;
                return DirectionOutcome::Failed {
                    bytes,
                    error: e.to_string(),
                };
            }
        };
        if let Err(e) = sink.write(&buf[..n]).await {
            warn!(stream = "stdin", error = %e, "remote write failed");
            let _ = sink.close().await;
            return DirectionOutcome::Failed {
                bytes,
                error: e.to_string(),
            };
        }
        bytes += n as u64;
    }

    // EOF, including an immediately empty stdin: the remote must see it.
    match sink.close().await {
        Ok(()) => DirectionOutcome::Completed { bytes },
        Err(e) => {
            warn!(stream = "stdin", error = %e, "closing remote stdin failed");
            DirectionOutcome::Failed {
                bytes,
                error: e.to_string(),
            }
        }
    }
}

async fn copy_to_host(
    kind: StreamKind,
    mut source: Box<dyn RemoteSource>,
    mut dst: LocalWriter,
    shutdown: ShutdownSignal,
) -> DirectionOutcome {
    let mut bytes = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                let _ = dst.shutdown().await;
                return DirectionOutcome::Cancelled { bytes };
            }
            next = source.next_chunk() => next,
        };
        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                warn!(stream = %kind, error = %e, "remote read failed");
                let _ = dst.shutdown().await;
                return DirectionOutcome::Failed {
                    bytes,
                    error: e.to_string(),
                };
            }
        };
        let written = async {
            dst.write_all(&chunk).await?;
            dst.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(stream = %kind, error = %e, "local write failed");
            return DirectionOutcome::Failed {
                bytes,
                error: e.to_string(),
            };
        }
        bytes += chunk.len() as u64;
    }

    if let Err(e) = dst.shutdown().await {
        debug!(stream = %kind, error = %e, "closing local writer failed");
    }
    DirectionOutcome::Completed { bytes }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
