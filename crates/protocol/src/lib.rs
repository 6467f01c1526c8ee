//! Wire protocol for the OpenKanban daemon.
//!
//! Clients talk to the daemon over a local stream socket using
//! length-prefixed frames:
//!
//! ```text
//! ┌────────┬────────────────┬────────────────┐
//! │ type:1 │ length:4 (BE)  │ data: length B │
//! └────────┴────────────────┴────────────────┘
//! ```
//!
//! [`framing`] handles the byte-level encode/decode, [`messages`] maps frames
//! onto typed [`Message`](messages::Message) values.

pub mod error;
pub mod framing;
pub mod messages;

pub use error::ProtocolError;
pub use framing::{FrameCodec, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use messages::Message;

/// Convenience alias used throughout the protocol crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;
