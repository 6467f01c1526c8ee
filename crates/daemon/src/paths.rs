//! Filesystem layout for daemon state.
//!
//! Everything the daemon persists lives under `~/.openkanban`:
//! `daemon.sock` (rendezvous socket), `daemon.pid`, `board.json`, and
//! `daemon.log`. Agent status hints are read from
//! `~/.cache/openkanban-status/<session_id>.status`.

use std::fs;
use std::io;
use std::path::PathBuf;

/// Directory name under the user's home for daemon state.
const STATE_DIR_NAME: &str = ".openkanban";

/// Directory under `~/.cache` where agents drop status hint files.
const STATUS_DIR_NAME: &str = "openkanban-status";

/// Returns the daemon state directory (`~/.openkanban`).
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STATE_DIR_NAME)
}

/// Returns the rendezvous socket path (`~/.openkanban/daemon.sock`).
pub fn socket_path() -> PathBuf {
    state_dir().join("daemon.sock")
}

/// Returns the PID file path (`~/.openkanban/daemon.pid`).
pub fn pid_file_path() -> PathBuf {
    state_dir().join("daemon.pid")
}

/// Returns the board state path (`~/.openkanban/board.json`).
pub fn board_path() -> PathBuf {
    state_dir().join("board.json")
}

/// Returns the daemon log path (`~/.openkanban/daemon.log`).
pub fn log_path() -> PathBuf {
    state_dir().join("daemon.log")
}

/// Returns the directory agents write status hints into
/// (`~/.cache/openkanban-status`).
pub fn agent_status_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".cache")
        })
        .join(STATUS_DIR_NAME)
}

/// Creates the state directory with user-only permissions.
///
/// The directory holds the rendezvous socket, so `0700` is part of the
/// security boundary: filesystem permissions are the only authentication
/// the daemon has.
pub fn ensure_state_dir() -> io::Result<PathBuf> {
    let dir = state_dir();
    fs::create_dir_all(&dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(dir)
}
