//! systemd user-service integration.
//!
//! Installs a unit under `~/.config/systemd/user` (honoring
//! `XDG_CONFIG_HOME`) and drives it with `systemctl --user`.

use std::path::PathBuf;

use super::{home_dir, run, ServiceError, ServiceManager};

const SERVICE_NAME: &str = "openkanban-daemon";

pub struct SystemdManager;

impl SystemdManager {
    pub fn new() -> Self {
        Self
    }

    fn service_dir(&self) -> PathBuf {
        let config = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".config"));
        config.join("systemd").join("user")
    }

    fn service_path(&self) -> PathBuf {
        self.service_dir().join(format!("{SERVICE_NAME}.service"))
    }
}

impl Default for SystemdManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the unit file.
pub fn unit_file(bin_path: &str) -> String {
    let home = home_dir();
    let path = std::env::var("PATH").unwrap_or_default();
    format!(
        r#"[Unit]
Description=OpenKanban Daemon - Persistent PTY sessions for AI agents
After=network.target

[Service]
Type=simple
ExecStart={bin_path} daemon run
Restart=on-failure
RestartSec=5
Environment=HOME={home}
Environment=PATH={path}

[Install]
WantedBy=default.target
"#,
        home = home.display(),
    )
}

impl ServiceManager for SystemdManager {
    fn install(&self, bin_path: &str) -> Result<(), ServiceError> {
        std::fs::create_dir_all(self.service_dir())
            .map_err(|e| ServiceError::io("create service dir", e))?;
        std::fs::write(self.service_path(), unit_file(bin_path))
            .map_err(|e| ServiceError::io("write service file", e))?;

        run("daemon-reload", "systemctl", &["--user", "daemon-reload"])?;
        run("enable service", "systemctl", &["--user", "enable", SERVICE_NAME])?;
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ServiceError> {
        let _ = run("stop service", "systemctl", &["--user", "stop", SERVICE_NAME]);
        let _ = run("disable service", "systemctl", &["--user", "disable", SERVICE_NAME]);

        match std::fs::remove_file(self.service_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ServiceError::io("remove service file", e)),
        }

        let _ = run("daemon-reload", "systemctl", &["--user", "daemon-reload"]);
        Ok(())
    }

    fn start(&self) -> Result<(), ServiceError> {
        run("start service", "systemctl", &["--user", "start", SERVICE_NAME]).map(|_| ())
    }

    fn stop(&self) -> Result<(), ServiceError> {
        run("stop service", "systemctl", &["--user", "stop", SERVICE_NAME]).map(|_| ())
    }

    fn status(&self) -> String {
        if !self.is_installed() {
            return "not installed".to_string();
        }
        let output = std::process::Command::new("systemctl")
            .args(["--user", "is-active", SERVICE_NAME])
            .output();
        match output {
            Ok(output) => {
                match String::from_utf8_lossy(&output.stdout).trim() {
                    "active" => "running".to_string(),
                    "inactive" | "failed" => "stopped".to_string(),
                    _ => "unknown".to_string(),
                }
            }
            Err(_) => "unknown".to_string(),
        }
    }

    fn is_installed(&self) -> bool {
        self.service_path().exists()
    }
}
