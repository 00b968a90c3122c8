use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use shim_core::{AgentError, SignalEvent, StreamKind};

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Frames sent by the shim. One JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello { container_id: String, exec_id: String },
    Stdin { data_b64: String },
    CloseStdin,
    Signal { signal: i32 },
    Resize { rows: u16, cols: u16 },
    Wait,
}

/// Frames sent by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Ready,
    Stdout { data_b64: String },
    Stderr { data_b64: String },
    Eof { stream: StreamKind },
    Exit { code: i32 },
    Error { message: String },
}

impl ClientFrame {
    pub fn stdin(data: &[u8]) -> Self {
        ClientFrame::Stdin {
            data_b64: STANDARD.encode(data),
        }
    }
}

impl From<SignalEvent> for ClientFrame {
    fn from(event: SignalEvent) -> Self {
        match event {
            SignalEvent::Signal { signal } => ClientFrame::Signal { signal },
            SignalEvent::Resize { rows, cols } => ClientFrame::Resize { rows, cols },
        }
    }
}

impl AgentFrame {
    pub fn output(stream: StreamKind, data: &[u8]) -> Self {
        let data_b64 = STANDARD.encode(data);
        match stream {
            StreamKind::Stderr => AgentFrame::Stderr { data_b64 },
            _ => AgentFrame::Stdout { data_b64 },
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serialize a frame as one newline-terminated JSON line.
pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, AgentError> {
    let mut line =
        serde_json::to_vec(frame).map_err(|e| AgentError::Protocol(format!("encode: {e}")))?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, AgentError> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| AgentError::Protocol(format!("decode {line:?}: {e}")))
}

pub fn decode_data(data_b64: &str) -> Result<Vec<u8>, AgentError> {
    STANDARD
        .decode(data_b64)
        .map_err(|e| AgentError::Protocol(format!("invalid base64 payload: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use shim_core::WindowSize;

    #[test]
    fn wire_shapes() {
        let line = encode(&ClientFrame::CloseStdin).unwrap();
        assert_eq!(line, b"{\"type\":\"close_stdin\"}\n");

        let line = encode(&ClientFrame::stdin(b"hi")).unwrap();
        assert_eq!(
            String::from_utf8(line).unwrap(),
            "{\"type\":\"stdin\",\"data_b64\":\"aGk=\"}\n"
        );

        let frame: AgentFrame = decode("{\"type\":\"eof\",\"stream\":\"stderr\"}\n").unwrap();
        assert_eq!(
            frame,
            AgentFrame::Eof {
                stream: StreamKind::Stderr
            }
        );
    }

    #[test]
    fn signal_events_map_to_frames() {
        assert_eq!(
            ClientFrame::from(SignalEvent::signal(2)),
            ClientFrame::Signal { signal: 2 }
        );
        assert_eq!(
            ClientFrame::from(SignalEvent::resize(WindowSize::new(24, 80))),
            ClientFrame::Resize { rows: 24, cols: 80 }
        );
    }

    #[test]
    fn output_payload_decodes() {
        let frame = AgentFrame::output(StreamKind::Stdout, b"hello");
        let AgentFrame::Stdout { data_b64 } = frame else {
            panic!("expected stdout frame");
        };
        assert_eq!(decode_data(&data_b64).unwrap(), b"hello");
    }

    #[test]
    fn garbage_is_protocol_error() {
        assert!(matches!(
            decode::<AgentFrame>("not json"),
            Err(AgentError::Protocol(_))
        ));
        assert!(matches!(decode_data("@@@"), Err(AgentError::Protocol(_))));
    }
}
