//! PID file utilities for daemon running detection.
//!
//! The PID file at `~/.openkanban/daemon.pid` lets tooling (service
//! managers, `daemon status`) find the running daemon without touching the
//! socket. Liveness is probed with a zero signal; stale files are cleaned
//! up on sight.

use std::fs;
use std::path::Path;

/// Write the current process id to `path`.
pub fn write_pid_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Read the PID file and return the pid if that process is alive.
///
/// Unparseable and stale files are unlinked and yield `None`.
pub fn read_live_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    let pid: u32 = match contents.trim().parse() {
        Ok(pid) => pid,
        Err(_) => {
            let _ = fs::remove_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        let _ = fs::remove_file(path);
        None
    }
}

/// Remove the PID file. Called during shutdown.
pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Check whether a process with the given pid exists.
///
/// Signal 0 delivers nothing; it only reports whether the target exists.
fn is_process_running(pid: u32) -> bool {
    // SAFETY: kill with signal 0 performs no action on the target.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_own_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        write_pid_file(&path).unwrap();
        assert_eq!(read_live_pid(&path), Some(std::process::id()));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(read_live_pid(&dir.path().join("daemon.pid")), None);
    }

    #[test]
    fn test_garbage_pid_file_cleaned_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        fs::write(&path, "not a pid").unwrap();

        assert_eq!(read_live_pid(&path), None);
        assert!(!path.exists(), "garbage PID file should be unlinked");
    }

    #[test]
    fn test_stale_pid_file_cleaned_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        // PIDs near the 32-bit cap are vanishingly unlikely to exist.
        fs::write(&path, "4000000000").unwrap();

        assert_eq!(read_live_pid(&path), None);
        assert!(!path.exists(), "stale PID file should be unlinked");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        write_pid_file(&path).unwrap();
        remove_pid_file(&path);
        remove_pid_file(&path);
        assert!(!path.exists());
    }
}
