use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{AgentError, AgentResult};

/// FHS-compliant location for agent state files.
const STATE_DIR: &str = "/var/lib/zedops-agent";

/// Old location (`~/.zedops-agent/`) kept only for one-time migration.
const LEGACY_DIR_NAME: &str = ".zedops-agent";

const TOKEN_FILE: &str = "token";
const EPHEMERAL_TOKEN_FILE: &str = "ephemeral-token";
const ALERT_CONFIG_FILE: &str = "alert-config.json";

/// Alert configuration received from the manager on auth and cached on disk
/// so alerts can fire while the manager is unreachable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertConfig {
    #[serde(default)]
    pub resend_api_key: String,
    #[serde(default)]
    pub resend_from_email: String,
    #[serde(default)]
    pub alert_recipients: Vec<AlertRecipient>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecipient {
    pub email: String,
    #[serde(default)]
    pub colors: AlertTheme,
}

/// Per-recipient theme colours used when templating alert HTML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertTheme {
    pub bg: String,
    pub card: String,
    pub border: String,
    pub accent: String,
    pub text: String,
    pub muted: String,
    pub success: String,
    pub error: String,
}

impl Default for AlertTheme {
    fn default() -> Self {
        Self {
            bg: "#080604".into(),
            card: "#121010".into(),
            border: "#2a1f17".into(),
            accent: "#f58b07".into(),
            text: "#e8e0d6".into(),
            muted: "#6b5d52".into(),
            success: "#22c55e".into(),
            error: "#ef4444".into(),
        }
    }
}

/// On-disk persistence for agent credentials and the alert-config cache.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new() -> Self {
        Self { dir: PathBuf::from(STATE_DIR) }
    }

    /// Store rooted at an arbitrary directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn token_path(&self) -> PathBuf {
        self.dir.join(TOKEN_FILE)
    }

    pub fn ephemeral_token_path(&self) -> PathBuf {
        self.dir.join(EPHEMERAL_TOKEN_FILE)
    }

    pub fn alert_config_path(&self) -> PathBuf {
        self.dir.join(ALERT_CONFIG_FILE)
    }

    fn ensure_dir(&self) -> AgentResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| AgentError::IoError(format!("failed to create state directory {}: {}", self.dir.display(), e)))?;
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        Ok(())
    }

    /// Move token and alert config from the legacy home-directory location.
    /// No-op when the legacy directory is absent or destinations exist.
    pub fn migrate_from_legacy_dir(&self) {
        let Some(home) = std::env::var_os("HOME") else {
            return;
        };
        let legacy = Path::new(&home).join(LEGACY_DIR_NAME);
        if !legacy.is_dir() {
            return;
        }
        if let Err(e) = self.ensure_dir() {
            warn!("Migration: failed to create state dir: {}", e);
            return;
        }

        let mut migrated = 0;
        for name in [TOKEN_FILE, ALERT_CONFIG_FILE] {
            let src = legacy.join(name);
            let dst = self.dir.join(name);
            if !src.exists() || dst.exists() {
                continue;
            }

            let data = match fs::read(&src) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Migration: failed to read {}: {}", src.display(), e);
                    continue;
                }
            };

            // The old install script saved ephemeral JWTs to the permanent
            // token path; never carry those forward.
            if name == TOKEN_FILE && is_ephemeral_jwt(&String::from_utf8_lossy(&data)) {
                warn!("Migration: deleting stale ephemeral JWT at {}", src.display());
                let _ = fs::remove_file(&src);
                continue;
            }

            if let Err(e) = write_restricted(&dst, &data) {
                warn!("Migration: failed to write {}: {}", dst.display(), e);
                continue;
            }
            let _ = fs::remove_file(&src);
            migrated += 1;
            info!("Migration: moved {} -> {}", src.display(), dst.display());
        }

        if migrated > 0 {
            // Only succeeds if the legacy dir is now empty.
            let _ = fs::remove_dir(&legacy);
        }
    }

    /// Load the permanent token. A stored token whose JWT payload declares
    /// `type=ephemeral` is a leftover from a broken install and is deleted.
    pub fn load_token(&self) -> AgentResult<String> {
        let token = read_optional(&self.token_path())?;
        if token.is_empty() {
            return Ok(token);
        }
        if is_ephemeral_jwt(&token) {
            warn!(
                "Permanent token file contains a stale ephemeral JWT, deleting {}",
                self.token_path().display()
            );
            let _ = fs::remove_file(self.token_path());
            return Ok(String::new());
        }
        Ok(token)
    }

    pub fn save_token(&self, token: &str) -> AgentResult<()> {
        self.ensure_dir()?;
        write_restricted(&self.token_path(), token.as_bytes())
            .map_err(|e| AgentError::IoError(format!("failed to write token: {}", e)))
    }

    pub fn load_ephemeral_token(&self) -> AgentResult<String> {
        read_optional(&self.ephemeral_token_path())
    }

    pub fn delete_ephemeral_token(&self) -> AgentResult<()> {
        match fs::remove_file(self.ephemeral_token_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::IoError(format!("failed to delete ephemeral token: {}", e))),
        }
    }

    /// Returns None when the agent has never received an alert config.
    pub fn load_alert_config(&self) -> AgentResult<Option<AlertConfig>> {
        let path = self.alert_config_path();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AgentError::IoError(format!("failed to read alert config: {}", e))),
        };
        let config = serde_json::from_slice(&data)?;
        Ok(Some(config))
    }

    pub fn save_alert_config(&self, config: &AlertConfig) -> AgentResult<()> {
        self.ensure_dir()?;
        let data = serde_json::to_vec_pretty(config)?;
        write_restricted(&self.alert_config_path(), &data)
            .map_err(|e| AgentError::IoError(format!("failed to write alert config: {}", e)))
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read_optional(path: &Path) -> AgentResult<String> {
    match fs::read_to_string(path) {
        Ok(data) => Ok(data.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(AgentError::IoError(format!("failed to read {}: {}", path.display(), e))),
    }
}

fn write_restricted(path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

/// Lightweight check for an ephemeral JWT: decode the payload segment and
/// look at the `type` claim. No signature verification.
pub fn is_ephemeral_jwt(token: &str) -> bool {
    let parts: Vec<&str> = token.trim().split('.').collect();
    if parts.len() != 3 {
        return false;
    }
    let Ok(payload) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(parts[1]) else {
        return false;
    };

    #[derive(Deserialize)]
    struct Claims {
        #[serde(rename = "type")]
        token_type: Option<String>,
    }
    match serde_json::from_slice::<Claims>(&payload) {
        Ok(claims) => claims.token_type.as_deref() == Some("ephemeral"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ephemeral_jwt() -> String {
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"HS256\"}");
        let payload =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"type\":\"ephemeral\",\"exp\":1}");
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn detects_ephemeral_jwt() {
        assert!(is_ephemeral_jwt(&ephemeral_jwt()));
        assert!(!is_ephemeral_jwt("opaque-permanent-token"));
        assert!(!is_ephemeral_jwt("a.b"));
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"type\":\"access\"}");
        assert!(!is_ephemeral_jwt(&format!("h.{payload}.s")));
    }

    #[test]
    fn token_roundtrip_with_restricted_mode() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::at(tmp.path().join("state"));

        assert_eq!(store.load_token().unwrap(), "");
        store.save_token("PERM").unwrap();
        assert_eq!(store.load_token().unwrap(), "PERM");

        let mode = fs::metadata(store.token_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = fs::metadata(tmp.path().join("state")).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn stale_ephemeral_token_is_deleted_on_load() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::at(tmp.path());
        store.save_token(&ephemeral_jwt()).unwrap();

        assert_eq!(store.load_token().unwrap(), "");
        assert!(!store.token_path().exists());
    }

    #[test]
    fn alert_config_cache_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::at(tmp.path());

        assert!(store.load_alert_config().unwrap().is_none());

        let config = AlertConfig {
            resend_api_key: "re_123".into(),
            resend_from_email: "alerts@example.com".into(),
            alert_recipients: vec![AlertRecipient {
                email: "ops@example.com".into(),
                colors: AlertTheme::default(),
            }],
        };
        store.save_alert_config(&config).unwrap();

        let loaded = store.load_alert_config().unwrap().unwrap();
        assert_eq!(loaded.resend_api_key, "re_123");
        assert_eq!(loaded.alert_recipients.len(), 1);
        assert_eq!(loaded.alert_recipients[0].email, "ops@example.com");
    }

    #[test]
    fn ephemeral_token_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::at(tmp.path());
        store.delete_ephemeral_token().unwrap();
        fs::create_dir_all(tmp.path()).unwrap();
        fs::write(store.ephemeral_token_path(), "EPH").unwrap();
        store.delete_ephemeral_token().unwrap();
        assert!(!store.ephemeral_token_path().exists());
    }
}
