//! # OpenKanban Daemon Library
//!
//! The daemon runs AI coding agents in persistent PTY sessions, one per
//! kanban ticket, and multiplexes their terminals to any number of attached
//! clients. Sessions outlive the clients that created them: a TUI can
//! disconnect, reconnect, or attach from another terminal without disturbing
//! the agent.
//!
//! ## Architecture
//!
//! ```text
//!  client ──frame──▶ codec ──▶ broker ──┬──▶ registry ──▶ session ──▶ PTY write
//!                                       └──▶ board store ──▶ subscriber broadcast
//!  child ──bytes──▶ PTY read ──▶ output channel ──▶ broker fan-out ──▶ clients
//! ```
//!
//! - [`session`] owns PTYs, child processes, and their lifecycles.
//! - [`broker`] routes control operations and fans session output out to
//!   subscribers, each behind a bounded [`connection`] send queue.
//! - [`ipc`] provides the unix-socket rendezvous and single-instance
//!   enforcement.
//! - [`board`] is the persistent kanban state whose mutations are broadcast
//!   to subscribed clients.
//! - [`web`] exposes the same operations over HTTP/WebSocket for browser
//!   front ends.
//! - [`service`] installs the daemon under the platform service manager.

pub mod agent_status;
pub mod board;
pub mod broker;
pub mod connection;
pub mod ipc;
pub mod paths;
pub mod service;
pub mod session;
pub mod web;
