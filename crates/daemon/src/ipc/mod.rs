//! Unix Domain Socket IPC: the daemon's local rendezvous endpoint.
//!
//! Clients exchange length-prefixed binary frames (see the `protocol`
//! crate) over a stream socket at `~/.openkanban/daemon.sock`. The socket
//! doubles as the single-instance lock: whoever holds the bind is the
//! daemon, and a connect probe distinguishes a live daemon from a stale
//! socket file. The PID file provides the same check for tooling that only
//! has signals.

pub mod client;
pub mod pidfile;
pub mod server;

pub use client::DaemonClient;
pub use pidfile::{read_live_pid, remove_pid_file, write_pid_file};
pub use server::{serve, DaemonSocket, SocketError};
