//! Session management module.
//!
//! This module provides PTY spawning and session lifecycle management.
//! Sessions can be created, attached to, detached from, resized, and
//! stopped; the registry maps caller-chosen session ids onto live sessions.

pub mod pty;
pub mod registry;

pub use pty::{OutputEvent, PtySession, SessionError, SessionId, SessionSpec};
pub use registry::{CreateOutcome, SessionRegistry};
