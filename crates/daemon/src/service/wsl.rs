//! WSL fallback for distributions without systemd.
//!
//! Installs a startup script under `~/.openkanban/bin` and hooks it into
//! `~/.profile`, so the daemon starts with the first login shell. Lifecycle
//! control falls back to the PID file.

use std::path::PathBuf;

use crate::ipc::pidfile;
use crate::paths;

use super::{home_dir, ServiceError, ServiceManager};

const SCRIPT_NAME: &str = "openkanban-daemon.sh";
const PROFILE_MARKER: &str = "# openkanban-daemon auto-start";

pub struct WslManager;

impl WslManager {
    pub fn new() -> Self {
        Self
    }

    fn script_dir(&self) -> PathBuf {
        home_dir().join(".openkanban").join("bin")
    }

    fn script_path(&self) -> PathBuf {
        self.script_dir().join(SCRIPT_NAME)
    }

    fn profile_path(&self) -> PathBuf {
        home_dir().join(".profile")
    }

    fn add_to_profile(&self) -> Result<(), ServiceError> {
        let profile = self.profile_path();
        let contents = match std::fs::read_to_string(&profile) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(ServiceError::io("read profile", e)),
        };

        if contents.contains(PROFILE_MARKER) {
            return Ok(());
        }

        let script = self.script_path();
        let entry = format!(
            "\n{PROFILE_MARKER}\nif [ -x \"{script}\" ]; then\n    \"{script}\"\nfi\n",
            script = script.display(),
        );
        std::fs::write(&profile, contents + &entry)
            .map_err(|e| ServiceError::io("write profile", e))
    }

    fn remove_from_profile(&self) -> Result<(), ServiceError> {
        let profile = self.profile_path();
        let contents = match std::fs::read_to_string(&profile) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ServiceError::io("read profile", e)),
        };

        // Drop the marker line through the closing `fi`.
        let mut kept = Vec::new();
        let mut skipping = false;
        for line in contents.lines() {
            if line.contains(PROFILE_MARKER) {
                skipping = true;
                continue;
            }
            if skipping {
                if line.trim() == "fi" {
                    skipping = false;
                }
                continue;
            }
            kept.push(line);
        }

        std::fs::write(&profile, kept.join("\n"))
            .map_err(|e| ServiceError::io("write profile", e))
    }
}

impl Default for WslManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the startup script.
pub fn startup_script(bin_path: &str) -> String {
    let pid_file = paths::pid_file_path();
    let log_file = paths::log_path();
    format!(
        r#"#!/bin/bash
PIDFILE="{pid_file}"
DAEMON="{bin_path}"

if [ -f "$PIDFILE" ]; then
    PID=$(cat "$PIDFILE")
    if kill -0 "$PID" 2>/dev/null; then
        exit 0
    fi
fi

nohup "$DAEMON" daemon run >> "{log_file}" 2>&1 &
"#,
        pid_file = pid_file.display(),
        log_file = log_file.display(),
    )
}

impl ServiceManager for WslManager {
    fn install(&self, bin_path: &str) -> Result<(), ServiceError> {
        std::fs::create_dir_all(self.script_dir())
            .map_err(|e| ServiceError::io("create script dir", e))?;

        let script = startup_script(bin_path);
        std::fs::write(self.script_path(), script)
            .map_err(|e| ServiceError::io("write startup script", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(self.script_path(), std::fs::Permissions::from_mode(0o755))
                .map_err(|e| ServiceError::io("chmod startup script", e))?;
        }

        self.add_to_profile()
    }

    fn uninstall(&self) -> Result<(), ServiceError> {
        let _ = self.stop();
        self.remove_from_profile()?;

        match std::fs::remove_file(self.script_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServiceError::io("remove script", e)),
        }
    }

    fn start(&self) -> Result<(), ServiceError> {
        super::run(
            "run startup script",
            "bash",
            &[&self.script_path().display().to_string()],
        )
        .map(|_| ())
    }

    fn stop(&self) -> Result<(), ServiceError> {
        if let Some(pid) = pidfile::read_live_pid(&paths::pid_file_path()) {
            // SAFETY: plain SIGTERM to the recorded daemon pid.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        Ok(())
    }

    fn status(&self) -> String {
        if !self.is_installed() {
            return "not installed".to_string();
        }
        match pidfile::read_live_pid(&paths::pid_file_path()) {
            Some(_) => "running".to_string(),
            None => "stopped".to_string(),
        }
    }

    fn is_installed(&self) -> bool {
        self.script_path().exists()
    }
}
