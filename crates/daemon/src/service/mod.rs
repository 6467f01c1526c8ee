//! Platform service-manager integration.
//!
//! A thin installer: generate a unit/plist/startup script, hand lifecycle
//! control to the platform's own manager. One capability set, one
//! implementation per platform, picked by OS detection.

pub mod launchd;
pub mod systemd;
pub mod wsl;

use std::path::PathBuf;

use thiserror::Error;

pub use launchd::LaunchdManager;
pub use systemd::SystemdManager;
pub use wsl::WslManager;

/// Service management errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unsupported platform: {0}")]
    Unsupported(String),

    #[error("service not installed; run 'openkanban daemon install' first")]
    NotInstalled,

    #[error("{action} failed: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{action} failed: {detail}")]
    Command { action: &'static str, detail: String },
}

impl ServiceError {
    pub(crate) fn io(action: &'static str, source: std::io::Error) -> Self {
        Self::Io { action, source }
    }
}

/// The platform the daemon is being installed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Wsl,
    Unknown,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Wsl => "wsl",
            Platform::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Service manager capability set.
///
/// `status` returns one of `running`, `stopped`, `not installed`,
/// `unknown`.
pub trait ServiceManager {
    fn install(&self, bin_path: &str) -> Result<(), ServiceError>;
    fn uninstall(&self) -> Result<(), ServiceError>;
    fn start(&self) -> Result<(), ServiceError>;
    fn stop(&self) -> Result<(), ServiceError>;
    fn status(&self) -> String;
    fn is_installed(&self) -> bool;
}

/// Detect the current platform.
pub fn detect_platform() -> Platform {
    if cfg!(target_os = "macos") {
        Platform::MacOs
    } else if cfg!(target_os = "linux") {
        if is_wsl() {
            Platform::Wsl
        } else {
            Platform::Linux
        }
    } else {
        Platform::Unknown
    }
}

/// WSL kernels advertise themselves in /proc/version.
fn is_wsl() -> bool {
    match std::fs::read_to_string("/proc/version") {
        Ok(contents) => {
            let lower = contents.to_lowercase();
            lower.contains("microsoft") || lower.contains("wsl")
        }
        Err(_) => false,
    }
}

/// Whether systemd is actually managing this system (not just installed).
fn has_systemd() -> bool {
    which_exists("systemctl") && std::path::Path::new("/run/systemd/system").exists()
}

fn which_exists(cmd: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(cmd).is_file())
        })
        .unwrap_or(false)
}

/// Pick the service manager for this platform.
pub fn manager() -> Result<Box<dyn ServiceManager>, ServiceError> {
    match detect_platform() {
        Platform::MacOs => Ok(Box::new(LaunchdManager::new())),
        Platform::Linux => {
            if has_systemd() {
                Ok(Box::new(SystemdManager::new()))
            } else {
                Err(ServiceError::Unsupported(
                    "systemd not available on this Linux system".into(),
                ))
            }
        }
        Platform::Wsl => {
            if has_systemd() {
                Ok(Box::new(SystemdManager::new()))
            } else {
                Ok(Box::new(WslManager::new()))
            }
        }
        Platform::Unknown => Err(ServiceError::Unsupported(std::env::consts::OS.into())),
    }
}

/// The resolved path of the current executable.
pub fn binary_path() -> std::io::Result<PathBuf> {
    std::env::current_exe()?.canonicalize()
}

pub(crate) fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Run a command, mapping failure exit codes into [`ServiceError`].
pub(crate) fn run(
    action: &'static str,
    cmd: &str,
    args: &[&str],
) -> Result<std::process::Output, ServiceError> {
    let output = std::process::Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| ServiceError::io(action, e))?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(ServiceError::Command {
            action,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
