use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::{AgentError, AgentResult};

/// Periodic check cadence.
const CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Response of `<httpBase>/api/agent/version`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub download_urls: HashMap<String, String>,
}

/// Downloads new agent binaries and re-execs in place. The current
/// executable is replaced atomically via a sibling temp file + rename.
pub struct AutoUpdater {
    manager_url: String,
    current_version: String,
    current_binary: PathBuf,
    on_before_restart: Option<Box<dyn Fn() + Send + Sync>>,
}

impl AutoUpdater {
    pub fn new(manager_url: &str, current_version: &str) -> Self {
        let executable = std::env::current_exe().unwrap_or_else(|e| {
            warn!("Could not determine executable path: {}", e);
            PathBuf::from(std::env::args().next().unwrap_or_default())
        });
        // Resolve symlinks so the rename hits the real file.
        let executable = fs::canonicalize(&executable).unwrap_or(executable);

        Self {
            manager_url: manager_url.to_string(),
            current_version: current_version.to_string(),
            current_binary: executable,
            on_before_restart: None,
        }
    }

    /// Hook invoked just before the process re-execs.
    pub fn set_before_restart(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.on_before_restart = Some(Box::new(hook));
    }

    /// Check once on startup, then on a slow periodic cadence.
    pub fn start(self: std::sync::Arc<Self>) {
        tokio::spawn(async move {
            loop {
                self.check_and_update(false).await;
                tokio::time::sleep(CHECK_INTERVAL).await;
            }
        });
    }

    /// Manager pushed an update notification; cache-bust the version query.
    pub fn trigger_update(self: std::sync::Arc<Self>, version: &str) {
        info!("Received update notification from manager: version {} available", version);
        tokio::spawn(async move {
            self.check_and_update(true).await;
        });
    }

    async fn check_and_update(&self, bust_cache: bool) {
        info!("Checking for updates...");

        let (latest, download_url) = match self.latest_version(bust_cache).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Failed to check for updates: {}", e);
                return;
            }
        };

        if latest == self.current_version {
            info!("Agent is up to date (version {})", self.current_version);
            return;
        }
        if !is_newer_version(&latest, &self.current_version) {
            info!(
                "Remote version {} is not newer than current {}, skipping",
                latest, self.current_version
            );
            return;
        }

        info!("New version available: {} (current: {})", latest, self.current_version);
        if let Err(e) = self.download_and_apply(&download_url, &latest).await {
            warn!("Failed to apply update: {}", e);
        }
    }

    async fn latest_version(&self, bust_cache: bool) -> AgentResult<(String, String)> {
        let mut url = format!("{}/api/agent/version", http_base(&self.manager_url));
        if bust_cache {
            url = format!("{url}?t={}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default());
        }

        let resp = reqwest::get(&url).await?;
        if !resp.status().is_success() {
            return Err(AgentError::UpdateError(format!(
                "version endpoint returned status {}",
                resp.status()
            )));
        }
        let info: VersionInfo = resp.json().await?;

        let platform = platform_key();
        let download_url = info
            .download_urls
            .get(&platform)
            .cloned()
            .ok_or_else(|| AgentError::UpdateError(format!("no download URL for platform {platform}")))?;

        Ok((info.version, download_url))
    }

    async fn download_and_apply(&self, download_url: &str, new_version: &str) -> AgentResult<()> {
        info!("Downloading update from {}", download_url);

        let resp = reqwest::get(download_url).await?;
        if !resp.status().is_success() {
            return Err(AgentError::UpdateError(format!(
                "download returned status {}",
                resp.status()
            )));
        }
        let body = resp.bytes().await?;

        // Sibling temp file so the final rename stays on one filesystem.
        let dir = self
            .current_binary
            .parent()
            .ok_or_else(|| AgentError::UpdateError("executable has no parent directory".into()))?;
        let tmp_path = dir.join(format!(".zedops-agent-update-{}", std::process::id()));

        if let Err(e) = fs::write(&tmp_path, &body) {
            let _ = fs::remove_file(&tmp_path);
            return Err(AgentError::UpdateError(format!("failed to write update: {e}")));
        }
        if let Err(e) = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o755)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(AgentError::UpdateError(format!("failed to make update executable: {e}")));
        }

        info!("Applying update...");
        if let Err(e) = fs::rename(&tmp_path, &self.current_binary) {
            let _ = fs::remove_file(&tmp_path);
            return Err(AgentError::UpdateError(format!("failed to replace binary: {e}")));
        }

        info!("Update applied successfully! Restarting to version {}...", new_version);
        self.restart()
    }

    /// Replace the current process with the new binary, preserving argv and
    /// environment. The supervisor keeps seeing the same PID.
    fn restart(&self) -> AgentResult<()> {
        if let Some(hook) = &self.on_before_restart {
            hook();
        }

        let path = CString::new(self.current_binary.to_string_lossy().as_bytes())
            .map_err(|e| AgentError::UpdateError(format!("invalid executable path: {e}")))?;
        let args: Vec<CString> = std::env::args()
            .filter_map(|arg| CString::new(arg).ok())
            .collect();

        info!("Executing new binary...");
        nix::unistd::execv(&path, &args)
            .map_err(|e| AgentError::UpdateError(format!("exec failed: {e}")))?;
        Ok(())
    }
}

/// Derive the HTTP base from the WebSocket manager URL.
fn http_base(manager_url: &str) -> String {
    let mut base = manager_url.replacen("wss://", "https://", 1);
    base = base.replacen("ws://", "http://", 1);
    base.trim_end_matches("/ws").to_string()
}

/// Key into the manager's per-platform download map ("os-arch").
fn platform_key() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{}-{}", std::env::consts::OS, arch)
}

/// Strict "newer than": MAJOR.MINOR.PATCH compared numerically.
pub fn is_newer_version(remote: &str, current: &str) -> bool {
    let r = parse_version(remote);
    let c = parse_version(current);
    for i in 0..3 {
        if r[i] > c[i] {
            return true;
        }
        if r[i] < c[i] {
            return false;
        }
    }
    false
}

fn parse_version(v: &str) -> [u64; 3] {
    let mut parts = [0u64; 3];
    for (i, s) in v.trim_start_matches('v').splitn(3, '.').enumerate() {
        parts[i] = s.parse().unwrap_or(0);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_comparison() {
        assert!(is_newer_version("1.0.11", "1.0.9"));
        assert!(is_newer_version("1.1.0", "1.0.99"));
        assert!(is_newer_version("2.0.0", "1.9.9"));
        assert!(!is_newer_version("1.0.9", "1.0.11"));
        assert!(!is_newer_version("1.0.11", "1.0.11"));
        assert!(!is_newer_version("dev", "1.0.0"));
        assert!(is_newer_version("1.0.0", "dev"));
    }

    #[test]
    fn http_base_from_ws_url() {
        assert_eq!(http_base("ws://mgr:8787/ws"), "http://mgr:8787");
        assert_eq!(http_base("wss://mgr.example.com/ws"), "https://mgr.example.com");
        assert_eq!(http_base("wss://mgr.example.com"), "https://mgr.example.com");
    }

    #[test]
    fn platform_key_is_os_dash_arch() {
        let key = platform_key();
        assert!(key.starts_with(std::env::consts::OS));
        assert!(key.contains('-'));
        assert!(!key.contains("x86_64"));
    }
}
