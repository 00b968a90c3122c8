use std::path::{Path, PathBuf};
use std::time::Duration;

use shim_agent::protocol::{self, AgentFrame, ClientFrame};
use shim_agent::{AgentClient, Connector, UnixAgentClient, UnixConnector};
use shim_core::{AgentError, SignalEvent, StreamKind, WindowSize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Scripted agent
// ---------------------------------------------------------------------------

async fn send(w: &mut OwnedWriteHalf, frame: AgentFrame) {
    w.write_all(&protocol::encode(&frame).unwrap()).await.unwrap();
}

/// Accept one connection, answer the handshake with `reply`, then run
/// `script`. Every client frame received is reported on the returned channel.
fn spawn_agent<F, Fut>(
    path: &Path,
    reply: AgentFrame,
    script: F,
) -> mpsc::UnboundedReceiver<ClientFrame>
where
    F: FnOnce(OwnedWriteHalf, mpsc::UnboundedSender<ClientFrame>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = UnixListener::bind(path).expect("bind agent socket");
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let hello = lines.next_line().await.unwrap().unwrap();
        seen_tx.send(protocol::decode(&hello).unwrap()).ok();
        send(&mut write_half, reply).await;

        let reader_seen = seen_tx.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                if reader_seen.send(protocol::decode(&line).unwrap()).is_err() {
                    break;
                }
            }
        });
        script(write_half, seen_tx).await;
    });
    seen_rx
}

fn socket_in(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("agent.sock")
}

async fn connect(path: &Path) -> Result<UnixAgentClient, AgentError> {
    let address = format!("unix://{}", path.display());
    UnixAgentClient::connect(&address, "c1", "e1", Duration::from_secs(2)).await
}

async fn drain(source: &mut Box<dyn shim_agent::RemoteSource>) -> Result<Vec<u8>, AgentError> {
    let mut out = Vec::new();
    while let Some(chunk) = source.next_chunk().await? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_sends_session_identity() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let mut seen = spawn_agent(&path, AgentFrame::Ready, |_w, _| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let _client = connect(&path).await.expect("connect");
    assert_eq!(
        seen.recv().await.unwrap(),
        ClientFrame::Hello {
            container_id: "c1".into(),
            exec_id: "e1".into()
        }
    );
}

#[tokio::test]
async fn unreachable_socket_is_connection_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = connect(&socket_in(&dir)).await;
    assert!(matches!(result, Err(AgentError::Connection(_))));
}

#[tokio::test]
async fn rejected_handshake_is_connection_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let _seen = spawn_agent(
        &path,
        AgentFrame::Error {
            message: "unknown container".into(),
        },
        |_w, _| async move {},
    );

    match connect(&path).await {
        Err(AgentError::Connection(msg)) => assert!(msg.contains("unknown container")),
        other => panic!("expected connection error, got {other:?}"),
    }
}

#[tokio::test]
async fn silent_agent_times_out_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let connector = UnixConnector::new().with_handshake_timeout(Duration::from_millis(100));
    let result = connector
        .connect(&path.display().to_string(), "c1", "e1")
        .await;
    assert!(matches!(result, Err(AgentError::Connection(_))));
}

#[tokio::test]
async fn output_streams_are_demultiplexed() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let _seen = spawn_agent(&path, AgentFrame::Ready, |mut w, _| async move {
        send(&mut w, AgentFrame::output(StreamKind::Stdout, b"hel")).await;
        send(&mut w, AgentFrame::output(StreamKind::Stderr, b"oops")).await;
        send(&mut w, AgentFrame::output(StreamKind::Stdout, b"lo")).await;
        send(&mut w, AgentFrame::Eof { stream: StreamKind::Stdout }).await;
        send(&mut w, AgentFrame::Eof { stream: StreamKind::Stderr }).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let client = connect(&path).await.unwrap();
    let mut streams = client.open_io_streams().await.unwrap();
    assert_eq!(drain(&mut streams.stdout).await.unwrap(), b"hello");
    assert_eq!(drain(&mut streams.stderr).await.unwrap(), b"oops");
}

#[tokio::test]
async fn unread_stderr_does_not_stall_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let _seen = spawn_agent(&path, AgentFrame::Ready, |mut w, _| async move {
        for _ in 0..300 {
            send(&mut w, AgentFrame::output(StreamKind::Stderr, b"noise")).await;
        }
        send(&mut w, AgentFrame::output(StreamKind::Stdout, b"x")).await;
        send(&mut w, AgentFrame::Eof { stream: StreamKind::Stdout }).await;
        send(&mut w, AgentFrame::Eof { stream: StreamKind::Stderr }).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let client = connect(&path).await.unwrap();
    let streams = client.open_io_streams().await.unwrap();
    let mut stdout = streams.stdout;
    drop(streams.stderr);

    let out = tokio::time::timeout(Duration::from_secs(2), drain(&mut stdout))
        .await
        .expect("stdout drained")
        .unwrap();
    assert_eq!(out, b"x");
}

#[tokio::test]
async fn io_streams_open_only_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let _seen = spawn_agent(&path, AgentFrame::Ready, |_w, _| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let client = connect(&path).await.unwrap();
    let _streams = client.open_io_streams().await.unwrap();
    assert!(matches!(
        client.open_io_streams().await,
        Err(AgentError::Protocol(_))
    ));
}

#[tokio::test]
async fn stdin_signals_and_resize_reach_agent_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let mut seen = spawn_agent(&path, AgentFrame::Ready, |_w, _| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let client = connect(&path).await.unwrap();
    let mut streams = client.open_io_streams().await.unwrap();
    streams.stdin.write(b"input").await.unwrap();
    streams.stdin.close().await.unwrap();
    // A second close is a no-op and sends nothing.
    streams.stdin.close().await.unwrap();
    client.send_signal(SignalEvent::signal(15)).await.unwrap();
    client
        .send_signal(SignalEvent::resize(WindowSize::new(40, 120)))
        .await
        .unwrap();

    let mut frames = Vec::new();
    for _ in 0..5 {
        frames.push(seen.recv().await.unwrap());
    }
    assert_eq!(
        &frames[1..],
        &[
            ClientFrame::stdin(b"input"),
            ClientFrame::CloseStdin,
            ClientFrame::Signal { signal: 15 },
            ClientFrame::Resize { rows: 40, cols: 120 },
        ]
    );
    assert!(matches!(
        streams.stdin.write(b"late").await,
        Err(AgentError::StreamClosed)
    ));
}

#[tokio::test]
async fn wait_returns_remote_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let _seen = spawn_agent(&path, AgentFrame::Ready, |mut w, _| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        send(&mut w, AgentFrame::Exit { code: 17 }).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let client = connect(&path).await.unwrap();
    let status = client.wait_exit(None).await.expect("wait");
    assert_eq!(status.code, 17);
}

#[tokio::test]
async fn dropped_connection_fails_wait_and_ends_streams() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let _seen = spawn_agent(&path, AgentFrame::Ready, |mut w, _| async move {
        send(&mut w, AgentFrame::output(StreamKind::Stdout, b"partial")).await;
        // Dropping the write half and returning closes the connection.
    });

    let client = connect(&path).await.unwrap();
    let mut streams = client.open_io_streams().await.unwrap();

    let first = streams.stdout.next_chunk().await.unwrap();
    assert_eq!(first.as_deref(), Some(&b"partial"[..]));
    assert!(matches!(
        streams.stdout.next_chunk().await,
        Err(AgentError::Unavailable(_))
    ));
    assert!(matches!(
        client.wait_exit(Some(Duration::from_secs(2))).await,
        Err(AgentError::Unavailable(_))
    ));
}

#[tokio::test]
async fn wait_deadline_elapses() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let _seen = spawn_agent(&path, AgentFrame::Ready, |_w, _| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let client = connect(&path).await.unwrap();
    let limit = Duration::from_millis(100);
    match client.wait_exit(Some(limit)).await {
        Err(AgentError::Timeout(d)) => assert_eq!(d, limit),
        other => panic!("expected timeout, got {other:?}"),
    }
}
