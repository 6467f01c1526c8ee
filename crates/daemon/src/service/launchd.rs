//! launchd integration for macOS.
//!
//! Installs a LaunchAgent plist under `~/Library/LaunchAgents` and drives
//! it with `launchctl load`/`unload`.

use std::path::PathBuf;

use super::{home_dir, run, ServiceError, ServiceManager};

const LAUNCHD_LABEL: &str = "com.openkanban.daemon";

pub struct LaunchdManager;

impl LaunchdManager {
    pub fn new() -> Self {
        Self
    }

    fn launch_agents_dir(&self) -> PathBuf {
        home_dir().join("Library").join("LaunchAgents")
    }

    fn plist_path(&self) -> PathBuf {
        self.launch_agents_dir().join(format!("{LAUNCHD_LABEL}.plist"))
    }

    fn log_dir(&self) -> PathBuf {
        home_dir().join(".openkanban").join("logs")
    }
}

impl Default for LaunchdManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the LaunchAgent plist.
pub fn plist(bin_path: &str, stdout_log: &str, stderr_log: &str) -> String {
    let home = home_dir();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{LAUNCHD_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{bin_path}</string>
        <string>daemon</string>
        <string>run</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <dict>
        <key>SuccessfulExit</key>
        <false/>
    </dict>
    <key>StandardOutPath</key>
    <string>{stdout_log}</string>
    <key>StandardErrorPath</key>
    <string>{stderr_log}</string>
    <key>EnvironmentVariables</key>
    <dict>
        <key>HOME</key>
        <string>{home}</string>
    </dict>
</dict>
</plist>
"#,
        home = home.display(),
    )
}

impl ServiceManager for LaunchdManager {
    fn install(&self, bin_path: &str) -> Result<(), ServiceError> {
        std::fs::create_dir_all(self.launch_agents_dir())
            .map_err(|e| ServiceError::io("create LaunchAgents dir", e))?;
        std::fs::create_dir_all(self.log_dir())
            .map_err(|e| ServiceError::io("create log dir", e))?;

        let stdout_log = self.log_dir().join("daemon.log");
        let stderr_log = self.log_dir().join("daemon.error.log");
        let content = plist(
            bin_path,
            &stdout_log.display().to_string(),
            &stderr_log.display().to_string(),
        );

        std::fs::write(self.plist_path(), content)
            .map_err(|e| ServiceError::io("write plist", e))
    }

    fn uninstall(&self) -> Result<(), ServiceError> {
        let _ = self.stop();
        match std::fs::remove_file(self.plist_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServiceError::io("remove plist", e)),
        }
    }

    fn start(&self) -> Result<(), ServiceError> {
        run(
            "launchctl load",
            "launchctl",
            &["load", &self.plist_path().display().to_string()],
        )
        .map(|_| ())
    }

    fn stop(&self) -> Result<(), ServiceError> {
        run(
            "launchctl unload",
            "launchctl",
            &["unload", &self.plist_path().display().to_string()],
        )
        .map(|_| ())
    }

    fn status(&self) -> String {
        if !self.is_installed() {
            return "not installed".to_string();
        }
        match std::process::Command::new("launchctl")
            .args(["list", LAUNCHD_LABEL])
            .output()
        {
            Ok(output) if output.status.success() => "running".to_string(),
            Ok(_) => "stopped".to_string(),
            Err(_) => "unknown".to_string(),
        }
    }

    fn is_installed(&self) -> bool {
        self.plist_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plist_content() {
        let content = plist("/usr/local/bin/openkanban", "/tmp/out.log", "/tmp/err.log");
        assert!(content.contains("<string>com.openkanban.daemon</string>"));
        assert!(content.contains("<string>/usr/local/bin/openkanban</string>"));
        assert!(content.contains("<string>daemon</string>"));
        assert!(content.contains("<string>run</string>"));
        assert!(content.contains("/tmp/out.log"));
    }

    #[test]
    fn test_plist_path_name() {
        let mgr = LaunchdManager::new();
        assert!(mgr
            .plist_path()
            .ends_with("LaunchAgents/com.openkanban.daemon.plist"));
    }
}
