//! Protocol message definitions for the OpenKanban daemon.
//!
//! Each variant of [`Message`] corresponds to one wire frame type. Payload
//! layouts are deliberately primitive: raw bytes for terminal I/O, two
//! big-endian `u16`s for resize, UTF-8 strings (NUL-separated where a frame
//! carries several) for everything else.

use crate::error::ProtocolError;
use crate::Result;

/// Wire type bytes, one per [`Message`] variant.
pub mod wire {
    /// PTY I/O (bidirectional).
    pub const DATA: u8 = 0x01;
    /// Window size (client → server): `rows:u16 BE, cols:u16 BE`.
    pub const RESIZE: u8 = 0x02;
    /// Session terminated (server → client), empty payload.
    pub const EXIT: u8 = 0x03;

    /// Attach to a session: payload is the session id.
    pub const ATTACH: u8 = 0x10;
    /// Create a session: `session_id \0 workdir \0 command \0 arg…`.
    pub const CREATE: u8 = 0x11;
    /// Session ready (server → client), empty payload.
    pub const SESSION_OK: u8 = 0x12;
    /// Session error (server → client): payload is the error message.
    pub const SESSION_ERROR: u8 = 0x13;
    /// Detach from the current session, empty payload.
    pub const DETACH: u8 = 0x14;
    /// List running sessions (client → server), empty payload.
    pub const LIST: u8 = 0x15;
    /// List response: NUL-separated session ids.
    pub const LIST_RESPONSE: u8 = 0x16;
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Raw PTY bytes, in either direction.
    Data(Vec<u8>),
    /// Terminal window size update.
    Resize {
        /// Terminal height in rows.
        rows: u16,
        /// Terminal width in columns.
        cols: u16,
    },
    /// The attached session terminated.
    Exit,
    /// Attach this connection to an existing session.
    Attach {
        /// Target session id.
        session_id: String,
    },
    /// Create a session (or attach if the id already exists).
    Create {
        /// Caller-chosen session id, unique in the registry.
        session_id: String,
        /// Working directory for the child process.
        workdir: String,
        /// Command to execute.
        command: String,
        /// Command arguments.
        args: Vec<String>,
    },
    /// The session is ready; reply to CREATE or ATTACH.
    SessionOk,
    /// CREATE or ATTACH failed.
    SessionError {
        /// Human-readable error message.
        message: String,
    },
    /// Detach this connection from its session.
    Detach,
    /// Request the list of running sessions.
    List,
    /// Reply to LIST.
    ListResponse {
        /// Ids of sessions currently running.
        session_ids: Vec<String>,
    },
}

impl Message {
    /// The wire type byte for this message.
    pub fn frame_type(&self) -> u8 {
        match self {
            Message::Data(_) => wire::DATA,
            Message::Resize { .. } => wire::RESIZE,
            Message::Exit => wire::EXIT,
            Message::Attach { .. } => wire::ATTACH,
            Message::Create { .. } => wire::CREATE,
            Message::SessionOk => wire::SESSION_OK,
            Message::SessionError { .. } => wire::SESSION_ERROR,
            Message::Detach => wire::DETACH,
            Message::List => wire::LIST,
            Message::ListResponse { .. } => wire::LIST_RESPONSE,
        }
    }

    /// Whether this is a DATA frame.
    ///
    /// DATA frames may be coalesced away under back-pressure; control frames
    /// never are.
    pub fn is_data(&self) -> bool {
        matches!(self, Message::Data(_))
    }

    /// Encode the payload portion of the frame.
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Message::Data(bytes) => bytes.clone(),
            Message::Resize { rows, cols } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&rows.to_be_bytes());
                buf.extend_from_slice(&cols.to_be_bytes());
                buf
            }
            Message::Exit | Message::SessionOk | Message::Detach | Message::List => Vec::new(),
            Message::Attach { session_id } => session_id.as_bytes().to_vec(),
            Message::Create {
                session_id,
                workdir,
                command,
                args,
            } => {
                let mut parts = vec![session_id.as_str(), workdir.as_str(), command.as_str()];
                parts.extend(args.iter().map(String::as_str));
                join_nul(&parts)
            }
            Message::SessionError { message } => message.as_bytes().to_vec(),
            Message::ListResponse { session_ids } => {
                let parts: Vec<&str> = session_ids.iter().map(String::as_str).collect();
                join_nul(&parts)
            }
        }
    }

    /// Decode a message from its type byte and payload.
    pub fn decode(frame_type: u8, payload: &[u8]) -> Result<Self> {
        match frame_type {
            wire::DATA => Ok(Message::Data(payload.to_vec())),
            wire::RESIZE => {
                if payload.len() < 4 {
                    return Err(ProtocolError::malformed(format!(
                        "resize payload too short: {} bytes",
                        payload.len()
                    )));
                }
                let rows = u16::from_be_bytes([payload[0], payload[1]]);
                let cols = u16::from_be_bytes([payload[2], payload[3]]);
                Ok(Message::Resize { rows, cols })
            }
            wire::EXIT => Ok(Message::Exit),
            wire::ATTACH => Ok(Message::Attach {
                session_id: utf8(payload)?,
            }),
            wire::CREATE => {
                let parts = split_nul(payload)?;
                let mut parts = parts.into_iter();
                let session_id = parts.next().unwrap_or_default();
                let workdir = parts.next().unwrap_or_default();
                let command = parts.next().unwrap_or_default();
                let args = parts.collect();
                Ok(Message::Create {
                    session_id,
                    workdir,
                    command,
                    args,
                })
            }
            wire::SESSION_OK => Ok(Message::SessionOk),
            wire::SESSION_ERROR => Ok(Message::SessionError {
                message: utf8(payload)?,
            }),
            wire::DETACH => Ok(Message::Detach),
            wire::LIST => Ok(Message::List),
            wire::LIST_RESPONSE => {
                let session_ids = if payload.is_empty() {
                    Vec::new()
                } else {
                    split_nul(payload)?
                };
                Ok(Message::ListResponse { session_ids })
            }
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

fn utf8(payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|e| ProtocolError::malformed(format!("invalid UTF-8 payload: {e}")))
}

fn join_nul(parts: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            buf.push(0);
        }
        buf.extend_from_slice(part.as_bytes());
    }
    buf
}

fn split_nul(payload: &[u8]) -> Result<Vec<String>> {
    payload
        .split(|&b| b == 0)
        .map(|part| {
            String::from_utf8(part.to_vec())
                .map_err(|e| ProtocolError::malformed(format!("invalid UTF-8 payload: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameCodec;

    fn roundtrip(msg: Message) -> Message {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&msg);
        let (decoded, consumed) = codec.decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        decoded
    }

    #[test]
    fn test_all_message_types_roundtrip() {
        let messages = vec![
            Message::Data(b"ls -la\r\n".to_vec()),
            Message::Resize { rows: 40, cols: 132 },
            Message::Exit,
            Message::Attach {
                session_id: "ticket-42".into(),
            },
            Message::Create {
                session_id: "ticket-42".into(),
                workdir: "/tmp/worktrees/ticket-42".into(),
                command: "claude".into(),
                args: vec!["--continue".into(), "-p".into()],
            },
            Message::SessionOk,
            Message::SessionError {
                message: "session not found: ticket-42".into(),
            },
            Message::Detach,
            Message::List,
            Message::ListResponse {
                session_ids: vec!["a".into(), "b".into(), "c".into()],
            },
        ];

        for msg in messages {
            let decoded = roundtrip(msg.clone());
            assert_eq!(decoded, msg, "roundtrip failed for {msg:?}");
        }
    }

    #[test]
    fn test_resize_payload_layout() {
        let payload = Message::Resize { rows: 40, cols: 132 }.encode_payload();
        assert_eq!(payload, vec![0, 40, 0, 132]);
    }

    #[test]
    fn test_resize_payload_too_short() {
        let result = Message::decode(wire::RESIZE, &[0, 40]);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_create_payload_is_nul_separated() {
        let payload = Message::Create {
            session_id: "s1".into(),
            workdir: "/tmp".into(),
            command: "/bin/sh".into(),
            args: vec!["-c".into(), "echo hi".into()],
        }
        .encode_payload();
        assert_eq!(payload, b"s1\0/tmp\0/bin/sh\0-c\0echo hi");
    }

    #[test]
    fn test_create_with_missing_fields_decodes_empty() {
        // A CREATE carrying only a session id still decodes; the server
        // validates and rejects the empty command.
        let msg = Message::decode(wire::CREATE, b"s1").unwrap();
        assert_eq!(
            msg,
            Message::Create {
                session_id: "s1".into(),
                workdir: String::new(),
                command: String::new(),
                args: vec![],
            }
        );
    }

    #[test]
    fn test_create_with_no_args() {
        let decoded = roundtrip(Message::Create {
            session_id: "s".into(),
            workdir: "/w".into(),
            command: "cat".into(),
            args: vec![],
        });
        match decoded {
            Message::Create { args, .. } => assert!(args.is_empty()),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_list_response_empty() {
        let decoded = roundtrip(Message::ListResponse { session_ids: vec![] });
        assert_eq!(decoded, Message::ListResponse { session_ids: vec![] });
    }

    #[test]
    fn test_attach_invalid_utf8() {
        let result = Message::decode(wire::ATTACH, &[0xFF, 0xFE]);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_is_data() {
        assert!(Message::Data(vec![]).is_data());
        assert!(!Message::Exit.is_data());
        assert!(!Message::SessionOk.is_data());
    }
}
