//! Wire protocols spoken by the gateway.
//!
//! # Browser envelope
//!
//! One JSON object per WebSocket text frame, discriminated by `type`:
//!
//! ```text
//! {"type":"connected","session_id":"..","host_id":"..","cols":80,"rows":24}
//! {"type":"ping"} / {"type":"pong"} / {"type":"disconnected"}
//! {"type":"input","data":"<base64>"}
//! {"type":"output","data":"<base64>"}
//! {"type":"resize","cols":120,"rows":40}
//! {"type":"command","data":{"command":"close"}}
//! {"type":"error","code":"invalid_input","message":".."}
//! ```
//!
//! Terminal bytes travel base64-encoded so NUL and other control bytes
//! survive text frames untouched.
//!
//! # Agent sub-protocol
//!
//! One tag byte followed by the payload; the transport is message oriented,
//! so no length prefix is needed:
//!
//! - `0x00` + bytes: keystrokes, forwarded verbatim
//! - `0x01` + `{"cols":int,"rows":int}`: resize
//! - `0xFF`: graceful end of stream
//!
//! # Monitor control messages
//!
//! Telemetry sockets exchange JSON objects discriminated by `action`:
//! `subscribe`/`unsubscribe` inbound, `state_update`/`error` outbound.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::state::HostStateSnapshot;

/// Tag byte for keystroke payloads.
pub const TAG_INPUT: u8 = 0x00;
/// Tag byte for resize notifications.
pub const TAG_RESIZE: u8 = 0x01;
/// Tag byte for the end-of-stream signal.
pub const TAG_EOF: u8 = 0xFF;

/// Decoding failures. All of them surface to browsers as `invalid_input`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),

    #[error("frame has no type discriminator")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} message: {reason}")]
    InvalidBody { kind: String, reason: String },

    #[error("empty agent frame")]
    EmptyFrame,

    #[error("unknown agent frame tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl CodecError {
    /// Error code reported to the browser for this failure.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::InvalidInput
    }
}

/// Machine-readable codes carried by `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The client sent a frame the gateway could not interpret.
    InvalidInput,
    /// The connection is being torn down.
    ConnectionClosed,
    /// The requested session does not exist or is owned by another socket.
    SessionUnavailable,
    /// The agent serving the session went away.
    AgentDisconnected,
}

/// Terminal geometry. Also the JSON body of agent resize frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Body of a `command` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBody {
    pub command: String,
}

/// A browser-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Connected {
        session_id: String,
        host_id: String,
        cols: u16,
        rows: u16,
    },
    Ping,
    Pong,
    Input {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Command {
        data: CommandBody,
    },
    Output {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Disconnected,
}

impl Envelope {
    /// Every `type` value the envelope understands.
    pub const KINDS: &'static [&'static str] = &[
        "connected",
        "ping",
        "pong",
        "input",
        "resize",
        "command",
        "output",
        "error",
        "disconnected",
    ];

    /// The `type` discriminator of this envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Connected { .. } => "connected",
            Envelope::Ping => "ping",
            Envelope::Pong => "pong",
            Envelope::Input { .. } => "input",
            Envelope::Resize { .. } => "resize",
            Envelope::Command { .. } => "command",
            Envelope::Output { .. } => "output",
            Envelope::Error { .. } => "error",
            Envelope::Disconnected => "disconnected",
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Envelope::Error {
            code,
            message: message.into(),
        }
    }

    /// Encode as the text of one WebSocket frame.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode one WebSocket text frame.
    ///
    /// Unknown discriminators and malformed bodies are reported separately so
    /// callers can log the difference; both map to `invalid_input`.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingType)?
            .to_string();
        if !Self::KINDS.contains(&kind.as_str()) {
            return Err(CodecError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|e| CodecError::InvalidBody {
            kind,
            reason: e.to_string(),
        })
    }
}

/// A message on the agent-facing byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentFrame {
    Input(Vec<u8>),
    Resize(TerminalSize),
    Eof,
}

impl AgentFrame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            AgentFrame::Input(data) => {
                let mut frame = Vec::with_capacity(data.len() + 1);
                frame.push(TAG_INPUT);
                frame.extend_from_slice(data);
                frame
            }
            AgentFrame::Resize(size) => {
                let mut frame = vec![TAG_RESIZE];
                // Two u16 fields cannot fail to serialize
                frame.extend(serde_json::to_vec(size).unwrap_or_default());
                frame
            }
            AgentFrame::Eof => vec![TAG_EOF],
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let (&tag, payload) = frame.split_first().ok_or(CodecError::EmptyFrame)?;
        match tag {
            TAG_INPUT => Ok(AgentFrame::Input(payload.to_vec())),
            TAG_RESIZE => serde_json::from_slice(payload)
                .map(AgentFrame::Resize)
                .map_err(|e| CodecError::InvalidBody {
                    kind: "resize".to_string(),
                    reason: e.to_string(),
                }),
            TAG_EOF => Ok(AgentFrame::Eof),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

/// Inbound control message on a telemetry socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MonitorRequest {
    Subscribe {
        #[serde(default)]
        host_ids: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        host_ids: Vec<String>,
    },
}

impl MonitorRequest {
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingType)?
            .to_string();
        if action != "subscribe" && action != "unsubscribe" {
            return Err(CodecError::UnknownType(action));
        }
        serde_json::from_value(value).map_err(|e| CodecError::InvalidBody {
            kind: action,
            reason: e.to_string(),
        })
    }
}

/// Outbound message on a telemetry socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MonitorEvent {
    StateUpdate { data: HostStateSnapshot },
    Error { code: ErrorCode, message: String },
}

impl MonitorEvent {
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Encode(e.to_string()))
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROL_BYTES: &[u8] = &[0x00, 0x0A, 0xFF, b'h', b'e', b'l', b'l', b'o'];

    mod envelope {
        use super::*;

        #[test]
        fn test_input_preserves_control_bytes() {
            let text = Envelope::Input {
                data: CONTROL_BYTES.to_vec(),
            }
            .encode()
            .unwrap();
            match Envelope::decode(&text).unwrap() {
                Envelope::Input { data } => assert_eq!(data, CONTROL_BYTES),
                other => panic!("unexpected envelope: {:?}", other),
            }
        }

        #[test]
        fn test_output_preserves_control_bytes() {
            let text = Envelope::Output {
                data: CONTROL_BYTES.to_vec(),
            }
            .encode()
            .unwrap();
            let json: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(json["type"], "output");
            assert_eq!(json["data"], "AAr/aGVsbG8=");
            assert_eq!(
                Envelope::decode(&text).unwrap(),
                Envelope::Output {
                    data: CONTROL_BYTES.to_vec()
                }
            );
        }

        #[test]
        fn test_decode_resize() {
            let env = Envelope::decode(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
            assert_eq!(env, Envelope::Resize { cols: 120, rows: 40 });
        }

        #[test]
        fn test_decode_resize_non_integer_is_invalid_body() {
            let err = Envelope::decode(r#"{"type":"resize","cols":"wide","rows":40}"#).unwrap_err();
            assert!(matches!(err, CodecError::InvalidBody { ref kind, .. } if kind == "resize"));
            assert_eq!(err.error_code(), ErrorCode::InvalidInput);
            let gateway: crate::gateway::error::GatewayError = err.into();
            assert_eq!(gateway.code(), "protocol_error");
        }

        #[test]
        fn test_decode_resize_fractional_is_invalid_body() {
            let err = Envelope::decode(r#"{"type":"resize","cols":1.5,"rows":40}"#).unwrap_err();
            assert!(matches!(err, CodecError::InvalidBody { .. }));
        }

        #[test]
        fn test_decode_command() {
            let env = Envelope::decode(r#"{"type":"command","data":{"command":"close"}}"#).unwrap();
            assert_eq!(
                env,
                Envelope::Command {
                    data: CommandBody {
                        command: "close".to_string()
                    }
                }
            );
        }

        #[test]
        fn test_decode_unknown_type() {
            let err = Envelope::decode(r#"{"type":"teleport"}"#).unwrap_err();
            assert_eq!(err, CodecError::UnknownType("teleport".to_string()));
        }

        #[test]
        fn test_decode_missing_type() {
            assert_eq!(
                Envelope::decode(r#"{"cols":1}"#).unwrap_err(),
                CodecError::MissingType
            );
        }

        #[test]
        fn test_decode_not_json() {
            assert!(matches!(
                Envelope::decode("not json").unwrap_err(),
                CodecError::Malformed(_)
            ));
        }

        #[test]
        fn test_decode_invalid_base64() {
            let err = Envelope::decode(r#"{"type":"input","data":"@@@"}"#).unwrap_err();
            assert!(matches!(err, CodecError::InvalidBody { .. }));
        }

        #[test]
        fn test_unit_variants_have_no_body() {
            assert_eq!(Envelope::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
            assert_eq!(Envelope::Pong.encode().unwrap(), r#"{"type":"pong"}"#);
            assert_eq!(
                Envelope::Disconnected.encode().unwrap(),
                r#"{"type":"disconnected"}"#
            );
        }

        #[test]
        fn test_every_kind_matches_discriminator() {
            let samples = vec![
                Envelope::Connected {
                    session_id: "s".into(),
                    host_id: "h".into(),
                    cols: 80,
                    rows: 24,
                },
                Envelope::Ping,
                Envelope::Pong,
                Envelope::Input { data: vec![1] },
                Envelope::Resize { cols: 1, rows: 1 },
                Envelope::Command {
                    data: CommandBody {
                        command: "close".into(),
                    },
                },
                Envelope::Output { data: vec![2] },
                Envelope::error(ErrorCode::InvalidInput, "bad"),
                Envelope::Disconnected,
            ];
            assert_eq!(samples.len(), Envelope::KINDS.len());
            for env in samples {
                let json: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
                assert_eq!(json["type"], env.kind());
                assert!(Envelope::KINDS.contains(&env.kind()));
            }
        }
    }

    mod error_codes {
        use super::*;

        #[test]
        fn test_error_envelope_codes_encode_and_decode() {
            for (code, wire) in [
                (ErrorCode::InvalidInput, "invalid_input"),
                (ErrorCode::ConnectionClosed, "connection_closed"),
                (ErrorCode::SessionUnavailable, "session_unavailable"),
                (ErrorCode::AgentDisconnected, "agent_disconnected"),
            ] {
                let text = Envelope::error(code, "m").encode().unwrap();
                let json: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(json["code"], wire);
                assert_eq!(Envelope::decode(&text).unwrap(), Envelope::error(code, "m"));
            }
        }
    }

    mod agent_frame {
        use super::*;

        #[test]
        fn test_input_frame_layout() {
            let frame = AgentFrame::Input(b"ls\n".to_vec()).encode();
            assert_eq!(frame, vec![0x00, b'l', b's', b'\n']);
        }

        #[test]
        fn test_resize_frame_layout() {
            let frame = AgentFrame::Resize(TerminalSize { cols: 120, rows: 40 }).encode();
            assert_eq!(frame[0], 0x01);
            assert_eq!(&frame[1..], br#"{"cols":120,"rows":40}"#);
        }

        #[test]
        fn test_eof_frame_layout() {
            assert_eq!(AgentFrame::Eof.encode(), vec![0xFF]);
        }

        #[test]
        fn test_decode_frames() {
            assert_eq!(
                AgentFrame::decode(&[0x00, 0x00, 0xFF]).unwrap(),
                AgentFrame::Input(vec![0x00, 0xFF])
            );
            assert_eq!(
                AgentFrame::decode(b"\x01{\"cols\":10,\"rows\":5}").unwrap(),
                AgentFrame::Resize(TerminalSize { cols: 10, rows: 5 })
            );
            assert_eq!(AgentFrame::decode(&[0xFF]).unwrap(), AgentFrame::Eof);
        }

        #[test]
        fn test_decode_rejects_bad_frames() {
            assert_eq!(AgentFrame::decode(&[]).unwrap_err(), CodecError::EmptyFrame);
            assert_eq!(
                AgentFrame::decode(&[0x02, 1]).unwrap_err(),
                CodecError::UnknownTag(0x02)
            );
            assert!(matches!(
                AgentFrame::decode(b"\x01{\"cols\":\"x\"}").unwrap_err(),
                CodecError::InvalidBody { .. }
            ));
        }
    }

    mod monitor {
        use super::*;

        #[test]
        fn test_decode_subscribe() {
            let req = MonitorRequest::decode(r#"{"action":"subscribe","host_ids":["H1","H2"]}"#)
                .unwrap();
            assert_eq!(
                req,
                MonitorRequest::Subscribe {
                    host_ids: vec!["H1".into(), "H2".into()]
                }
            );
        }

        #[test]
        fn test_decode_subscribe_without_hosts() {
            let req = MonitorRequest::decode(r#"{"action":"subscribe"}"#).unwrap();
            assert_eq!(req, MonitorRequest::Subscribe { host_ids: vec![] });
        }

        #[test]
        fn test_decode_unknown_action() {
            assert_eq!(
                MonitorRequest::decode(r#"{"action":"dance"}"#).unwrap_err(),
                CodecError::UnknownType("dance".into())
            );
        }

        #[test]
        fn test_state_update_shape() {
            let snapshot = HostStateSnapshot {
                host_id: "H1".into(),
                cpu_usage: 42.0,
                ..Default::default()
            };
            let text = MonitorEvent::StateUpdate { data: snapshot }.encode().unwrap();
            let json: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(json["action"], "state_update");
            assert_eq!(json["data"]["host_id"], "H1");
            assert_eq!(json["data"]["cpu_usage"], 42.0);
        }
    }
}
