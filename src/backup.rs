use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tar::{Archive, EntryType};
use tracing::{info, warn};

use crate::docker::DockerClient;
use crate::errors::{AgentError, AgentResult};
use crate::message::Message;
use crate::rcon::{self, RconConnection};
use crate::server::{dir_exists, tree_stats, walk_entries};
use crate::Agent;

/// Retention limit per server.
pub const MAX_BACKUPS_PER_SERVER: usize = 10;

/// Progress event published on `backup.progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    pub backup_id: String,
    pub server_name: String,
    /// saving, calculating, compressing, stopping, extracting, starting,
    /// complete, error
    pub phase: String,
    pub percent: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The `.meta.json` sidecar written alongside each archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMeta {
    pub backup_id: String,
    pub server_name: String,
    pub filename: String,
    pub size_bytes: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    pub pre_save_success: bool,
    /// Unix seconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupCreateRequest {
    pub server_name: String,
    #[serde(default)]
    pub data_path: String,
    #[serde(default)]
    pub backup_id: String,
    #[serde(default)]
    pub notes: String,
    /// Empty when the server is stopped.
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub rcon_port: u16,
    #[serde(default)]
    pub rcon_password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupCreateResponse {
    pub success: bool,
    pub backup_id: String,
    pub filename: String,
    pub size_bytes: i64,
    pub pre_save_success: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupListRequest {
    pub server_name: String,
    #[serde(default)]
    pub data_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDeleteRequest {
    pub server_name: String,
    #[serde(default)]
    pub data_path: String,
    pub filename: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRestoreRequest {
    pub server_name: String,
    #[serde(default)]
    pub data_path: String,
    pub filename: String,
    #[serde(default)]
    pub backup_id: String,
    #[serde(default)]
    pub container_id: String,
}

fn backups_dir(data_path: &str, server_name: &str) -> PathBuf {
    Path::new(data_path).join(server_name).join("backups")
}

fn meta_path_for(backups: &Path, filename: &str) -> PathBuf {
    let stem = filename.strip_suffix(".tar.gz").unwrap_or(filename);
    backups.join(format!("{stem}.meta.json"))
}

/// Reject names that could escape the backups directory.
fn validate_filename(filename: &str) -> AgentResult<()> {
    if filename.contains('/') || filename.contains("..") {
        return Err(AgentError::InvalidRequest("invalid filename".into()));
    }
    Ok(())
}

/// Filename-safe label: `[A-Za-z0-9_-]`, spaces to underscores, max 30.
pub fn sanitize_for_filename(s: &str) -> String {
    let mut out = String::new();
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else if c == ' ' {
            out.push('_');
        }
        if out.len() >= 30 {
            break;
        }
    }
    out
}

/// Try an RCON `save` against the container's backend address before a
/// backup. Non-fatal; the result only lands in the backup metadata.
pub async fn attempt_rcon_save(
    docker: &DockerClient,
    container_id: &str,
    port: u16,
    password: &str,
) -> bool {
    let ip = match docker.backend_ip(container_id).await {
        Ok(ip) => ip,
        Err(e) => {
            warn!("[Backup] RCON: {}", e);
            return false;
        }
    };

    let addr = format!("{ip}:{port}");
    info!("[Backup] RCON: connecting to {} for pre-save", addr);
    let mut conn = match RconConnection::connect(&addr, password, rcon::SAVE_DIAL_TIMEOUT).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("[Backup] RCON: connection failed: {}", e);
            return false;
        }
    };

    match conn.execute("save").await {
        Ok(_) => true,
        Err(e) => {
            warn!("[Backup] RCON: save command failed: {}", e);
            false
        }
    }
}

/// Create a tar.gz backup of the server's `data/` tree. The pre-save has
/// already happened (or not) by the time this runs; it only archives.
/// Synchronous; callers wrap it in `spawn_blocking`.
pub fn create_backup_archive(
    server_name: &str,
    data_path: &str,
    backup_id: &str,
    notes: &str,
    pre_save_success: bool,
    progress: &dyn Fn(BackupProgress),
) -> AgentResult<BackupCreateResponse> {
    let server_dir = Path::new(data_path).join(server_name);
    let data_dir = server_dir.join("data");
    let backups = server_dir.join("backups");

    if !dir_exists(&data_dir) {
        return Err(AgentError::BackupError(format!(
            "data directory does not exist: {}",
            data_dir.display()
        )));
    }
    fs::create_dir_all(&backups)
        .map_err(|e| AgentError::BackupError(format!("failed to create backups directory: {e}")))?;

    let report = |phase: &str, percent: i64| {
        progress(BackupProgress {
            backup_id: backup_id.to_string(),
            server_name: server_name.to_string(),
            phase: phase.to_string(),
            percent,
            error: None,
        });
    };

    report("calculating", 10);
    let (total_bytes, total_files) = tree_stats(&data_dir)
        .map_err(|e| AgentError::BackupError(format!("failed to calculate data size: {e}")))?;
    info!("[Backup] Data size: {} bytes, {} files", total_bytes, total_files);

    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S");
    let sanitized = sanitize_for_filename(notes);
    let label = if sanitized.is_empty() { "manual".to_string() } else { sanitized };
    let filename = format!("{timestamp}_{label}.tar.gz");
    let tar_path = backups.join(&filename);

    report("compressing", 15);
    let size_bytes = match write_tar_gz(&tar_path, &data_dir, total_bytes, &mut |percent| {
        report("compressing", percent)
    }) {
        Ok(size) => size,
        Err(e) => {
            let _ = fs::remove_file(&tar_path);
            return Err(AgentError::BackupError(format!("failed to create backup archive: {e}")));
        }
    };
    info!("[Backup] Archive created: {} ({} bytes)", filename, size_bytes);

    let meta = BackupMeta {
        backup_id: backup_id.to_string(),
        server_name: server_name.to_string(),
        filename: filename.clone(),
        size_bytes,
        notes: notes.to_string(),
        pre_save_success,
        created_at: chrono::Utc::now().timestamp(),
    };
    let meta_path = meta_path_for(&backups, &filename);
    match serde_json::to_vec_pretty(&meta) {
        Ok(data) => {
            if let Err(e) = fs::write(&meta_path, data) {
                warn!("[Backup] Failed to write meta file: {}", e);
            }
        }
        Err(e) => warn!("[Backup] Failed to serialize meta: {}", e),
    }

    enforce_retention(server_name, data_path);

    report("complete", 100);

    Ok(BackupCreateResponse {
        success: true,
        backup_id: backup_id.to_string(),
        filename,
        size_bytes,
        pre_save_success,
    })
}

/// Stream `data/` into a gzip-over-tar writer; entries use paths relative
/// to the data directory. Progress lands every >=5% in the 15-95 band.
fn write_tar_gz(
    tar_path: &Path,
    src_dir: &Path,
    total_bytes: i64,
    on_percent: &mut dyn FnMut(i64),
) -> io::Result<i64> {
    let out = fs::File::create(tar_path)?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut processed = 0i64;
    let mut last_percent = 15i64;

    walk_entries(src_dir, &mut |path, meta| {
        let rel = path
            .strip_prefix(src_dir)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "path outside archive root"))?;
        if meta.is_dir() {
            builder.append_path_with_name(path, rel)?;
        } else if meta.is_file() {
            builder.append_path_with_name(path, rel)?;
            processed += meta.len() as i64;
            if total_bytes > 0 {
                let percent = (processed * 80 / total_bytes + 15).min(95);
                if percent - last_percent >= 5 {
                    last_percent = percent;
                    on_percent(percent);
                }
            }
        }
        Ok(())
    })?;

    let encoder = builder.into_inner()?;
    encoder.finish()?.sync_all()?;

    Ok(fs::metadata(tar_path)?.len() as i64)
}

/// Extract an archive into a fresh directory, honouring entry modes and
/// rejecting any entry whose cleaned target escapes the destination.
fn extract_tar_gz(tar_path: &Path, dst_dir: &Path) -> AgentResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let input = fs::File::open(tar_path)
        .map_err(|e| AgentError::BackupError(format!("failed to open archive: {e}")))?;
    let mut archive = Archive::new(GzDecoder::new(input));

    for entry in archive
        .entries()
        .map_err(|e| AgentError::BackupError(format!("failed to read archive: {e}")))?
    {
        let mut entry = entry.map_err(|e| AgentError::BackupError(format!("corrupt archive entry: {e}")))?;
        let rel = entry
            .path()
            .map_err(|e| AgentError::BackupError(format!("invalid entry path: {e}")))?
            .into_owned();

        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(AgentError::BackupError(format!(
                "tar entry attempts path traversal: {}",
                rel.display()
            )));
        }
        let target = dst_dir.join(&rel);

        let mode = entry.header().mode().unwrap_or(0o644);
        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = fs::File::create(&target)?;
                io::copy(&mut entry, &mut out)
                    .map_err(|e| AgentError::BackupError(format!("failed to extract entry: {e}")))?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
            }
            _ => {}
        }
    }

    Ok(())
}

/// Read the backups directory, returning metadata newest-first. A sidecar
/// whose archive is missing is an orphan and is skipped.
pub fn list_backups(server_name: &str, data_path: &str) -> AgentResult<Vec<BackupMeta>> {
    let backups = backups_dir(data_path, server_name);
    if !dir_exists(&backups) {
        return Ok(Vec::new());
    }

    let mut result = Vec::new();
    for entry in fs::read_dir(&backups)
        .map_err(|e| AgentError::BackupError(format!("failed to read backups directory: {e}")))?
    {
        let entry = entry.map_err(|e| AgentError::BackupError(e.to_string()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".meta.json") || entry.path().is_dir() {
            continue;
        }

        let data = match fs::read(entry.path()) {
            Ok(data) => data,
            Err(e) => {
                warn!("[Backup] Failed to read meta file {}: {}", name, e);
                continue;
            }
        };
        let meta: BackupMeta = match serde_json::from_slice(&data) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("[Backup] Failed to parse meta file {}: {}", name, e);
                continue;
            }
        };

        if !backups.join(&meta.filename).exists() {
            warn!("[Backup] Orphaned meta file {} (archive missing)", name);
            continue;
        }

        result.push(meta);
    }

    result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(result)
}

/// Delete a backup's archive and sidecar. Missing files are ignored.
pub fn delete_backup(server_name: &str, data_path: &str, filename: &str) -> AgentResult<()> {
    validate_filename(filename)?;

    let backups = backups_dir(data_path, server_name);
    match fs::remove_file(backups.join(filename)) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(AgentError::BackupError(format!("failed to remove backup file: {e}"))),
    }
    if let Err(e) = fs::remove_file(meta_path_for(&backups, filename)) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("[Backup] Failed to remove meta file: {}", e);
        }
    }

    info!("[Backup] Deleted backup: {}/{}", server_name, filename);
    Ok(())
}

/// Keep the newest [`MAX_BACKUPS_PER_SERVER`] backups; delete the archive
/// and sidecar of anything older.
fn enforce_retention(server_name: &str, data_path: &str) {
    let backups = match list_backups(server_name, data_path) {
        Ok(backups) => backups,
        Err(e) => {
            warn!("[Backup] Failed to list backups for retention check: {}", e);
            return;
        }
    };
    if backups.len() <= MAX_BACKUPS_PER_SERVER {
        return;
    }

    let dir = backups_dir(data_path, server_name);
    for meta in &backups[MAX_BACKUPS_PER_SERVER..] {
        info!("[Backup] Retention: deleting old backup {}", meta.filename);
        let _ = fs::remove_file(dir.join(&meta.filename));
        let _ = fs::remove_file(meta_path_for(&dir, &meta.filename));
    }
}

/// Restore server data from a backup archive with rollback: the previous
/// `data/` is renamed aside first and swapped back if extraction fails.
pub async fn restore_from_backup(
    docker: Option<&DockerClient>,
    req: &BackupRestoreRequest,
    progress: impl Fn(BackupProgress),
) -> AgentResult<()> {
    let server_dir = Path::new(&req.data_path).join(&req.server_name);
    let data_dir = server_dir.join("data");
    let backups = server_dir.join("backups");
    let tar_path = backups.join(&req.filename);

    validate_filename(&req.filename)?;
    if !tar_path.exists() {
        return Err(AgentError::NotFound(format!("backup file not found: {}", req.filename)));
    }

    let report = |phase: &str, percent: i64| {
        progress(BackupProgress {
            backup_id: req.backup_id.clone(),
            server_name: req.server_name.clone(),
            phase: phase.to_string(),
            percent,
            error: None,
        });
    };

    // Stop the container and give it a moment to settle.
    if !req.container_id.is_empty() {
        if let Some(docker) = docker {
            report("stopping", 10);
            info!("[Restore] Stopping container {}", req.container_id);
            if let Err(e) = docker.stop_container(&req.container_id).await {
                warn!("[Restore] Failed to stop container (may already be stopped): {}", e);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    // Keep the current data as a rollback target.
    let mut pre_restore_dir: Option<PathBuf> = None;
    if dir_exists(&data_dir) {
        let aside = server_dir.join(format!("data.pre-restore.{}", chrono::Utc::now().timestamp()));
        report("extracting", 20);
        info!("[Restore] Moving current data to {}", aside.display());
        if let Err(e) = fs::rename(&data_dir, &aside) {
            if !req.container_id.is_empty() {
                if let Some(docker) = docker {
                    let _ = docker.start_container(&req.container_id).await;
                }
            }
            return Err(AgentError::BackupError(format!(
                "failed to move current data directory: {e}"
            )));
        }
        pre_restore_dir = Some(aside);
    }

    report("extracting", 30);
    info!("[Restore] Extracting {} to {}", req.filename, data_dir.display());

    let extract_result = {
        let tar_path = tar_path.clone();
        let data_dir = data_dir.clone();
        tokio::task::spawn_blocking(move || extract_tar_gz(&tar_path, &data_dir))
            .await
            .unwrap_or_else(|e| Err(AgentError::InternalError(format!("extract task failed: {e}"))))
    };

    if let Err(e) = extract_result {
        warn!("[Restore] Extraction failed: {}", e);
        if let Some(aside) = &pre_restore_dir {
            info!("[Restore] Rolling back: restoring pre-restore data");
            let _ = fs::remove_dir_all(&data_dir);
            if let Err(rename_err) = fs::rename(aside, &data_dir) {
                warn!(
                    "[Restore] CRITICAL: failed to rollback! Pre-restore at: {}, error: {}",
                    aside.display(),
                    rename_err
                );
            }
        }
        if !req.container_id.is_empty() {
            if let Some(docker) = docker {
                let _ = docker.start_container(&req.container_id).await;
            }
        }
        return Err(AgentError::BackupError(format!("failed to extract backup: {e}")));
    }

    if !req.container_id.is_empty() {
        if let Some(docker) = docker {
            report("starting", 90);
            info!("[Restore] Starting container {}", req.container_id);
            if let Err(e) = docker.start_container(&req.container_id).await {
                // Data is restored; the container can be started manually.
                warn!("[Restore] Failed to start container: {}", e);
            }
        }
    }

    // The pre-restore directory stays on disk as a safety net.
    if let Some(aside) = &pre_restore_dir {
        info!("[Restore] Pre-restore data kept at: {}", aside.display());
    }

    report("complete", 100);
    info!("[Restore] Restore complete for {} from {}", req.server_name, req.filename);
    Ok(())
}

// ==================== Handlers ====================

impl Agent {
    pub(crate) async fn handle_backup_create(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();

        let req: BackupCreateRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                if !reply.is_empty() {
                    let _ = self
                        .send_message(Message::new(
                            reply,
                            json!({"success": false, "error": "Invalid request format"}),
                        ))
                        .await;
                }
                return;
            }
        };

        info!("[Backup] Creating backup for {} (ID: {})", req.server_name, req.backup_id);

        // Validate the layout before touching the server over RCON.
        let data_dir = Path::new(&req.data_path).join(&req.server_name).join("data");
        if !dir_exists(&data_dir) {
            let error = format!("data directory does not exist: {}", data_dir.display());
            warn!("[Backup] Create failed for {}: {}", req.server_name, error);
            if !reply.is_empty() {
                let _ = self
                    .send_message(Message::new(
                        reply,
                        json!({"success": false, "backupId": req.backup_id, "error": error}),
                    ))
                    .await;
            }
            return;
        }

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel::<BackupProgress>();
        let forwarder = {
            let agent = self.clone();
            tokio::spawn(async move {
                while let Some(progress) = progress_rx.recv().await {
                    let _ = agent.send_message(Message::new("backup.progress", progress)).await;
                }
            })
        };

        // RCON pre-save while the server is running, then a flush window.
        let mut pre_save_success = false;
        if !req.container_id.is_empty() && req.rcon_port > 0 && !req.rcon_password.is_empty() {
            if let Some(docker) = self.docker.as_deref() {
                let _ = progress_tx.send(BackupProgress {
                    backup_id: req.backup_id.clone(),
                    server_name: req.server_name.clone(),
                    phase: "saving".into(),
                    percent: 5,
                    error: None,
                });
                pre_save_success =
                    attempt_rcon_save(docker, &req.container_id, req.rcon_port, &req.rcon_password).await;
                if pre_save_success {
                    info!("[Backup] RCON pre-save succeeded for {}", req.server_name);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                } else {
                    info!("[Backup] RCON pre-save failed for {} (continuing anyway)", req.server_name);
                }
            }
        }

        let result = {
            let req = req.clone();
            let progress_tx = progress_tx.clone();
            tokio::task::spawn_blocking(move || {
                create_backup_archive(
                    &req.server_name,
                    &req.data_path,
                    &req.backup_id,
                    &req.notes,
                    pre_save_success,
                    &|progress| {
                        let _ = progress_tx.send(progress);
                    },
                )
            })
            .await
            .unwrap_or_else(|e| Err(AgentError::InternalError(format!("backup task failed: {e}"))))
        };

        match result {
            Ok(response) => {
                drop(progress_tx);
                let _ = forwarder.await;
                if !reply.is_empty() {
                    let _ = self.send_message(Message::new(reply, response)).await;
                }
            }
            Err(e) => {
                warn!("[Backup] Create failed for {}: {}", req.server_name, e);
                let _ = progress_tx.send(BackupProgress {
                    backup_id: req.backup_id.clone(),
                    server_name: req.server_name.clone(),
                    phase: "error".into(),
                    percent: 0,
                    error: Some(e.to_string()),
                });
                drop(progress_tx);
                let _ = forwarder.await;
                if !reply.is_empty() {
                    let _ = self
                        .send_message(Message::new(
                            reply,
                            json!({"success": false, "backupId": req.backup_id, "error": e.to_string()}),
                        ))
                        .await;
                }
            }
        }
    }

    pub(crate) async fn handle_backup_list(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        if reply.is_empty() {
            return;
        }

        let req: BackupListRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                let _ = self
                    .send_message(Message::new(
                        reply,
                        json!({"success": false, "error": "Invalid request format"}),
                    ))
                    .await;
                return;
            }
        };

        let result = tokio::task::spawn_blocking(move || list_backups(&req.server_name, &req.data_path))
            .await
            .unwrap_or_else(|e| Err(AgentError::InternalError(format!("list task failed: {e}"))));

        let response = match result {
            Ok(backups) => json!({"success": true, "backups": backups}),
            Err(e) => json!({"success": false, "error": e.to_string()}),
        };
        let _ = self.send_message(Message::new(reply, response)).await;
    }

    pub(crate) async fn handle_backup_delete(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();

        let req: BackupDeleteRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                if !reply.is_empty() {
                    let _ = self
                        .send_message(Message::new(
                            reply,
                            json!({"success": false, "error": "Invalid request format"}),
                        ))
                        .await;
                }
                return;
            }
        };

        let response = match delete_backup(&req.server_name, &req.data_path, &req.filename) {
            Ok(()) => json!({"success": true}),
            Err(e) => json!({"success": false, "error": e.to_string()}),
        };
        if !reply.is_empty() {
            let _ = self.send_message(Message::new(reply, response)).await;
        }
    }

    pub(crate) async fn handle_backup_restore(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();

        let req: BackupRestoreRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                if !reply.is_empty() {
                    let _ = self
                        .send_message(Message::new(
                            reply,
                            json!({"success": false, "error": "Invalid request format"}),
                        ))
                        .await;
                }
                return;
            }
        };

        info!(
            "[Restore] Starting restore for {} from {} (ID: {})",
            req.server_name, req.filename, req.backup_id
        );

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel::<BackupProgress>();
        let forwarder = {
            let agent = self.clone();
            tokio::spawn(async move {
                while let Some(progress) = progress_rx.recv().await {
                    let _ = agent.send_message(Message::new("backup.progress", progress)).await;
                }
            })
        };

        let result = restore_from_backup(self.docker.as_deref(), &req, |progress| {
            let _ = progress_tx.send(progress);
        })
        .await;

        match result {
            Ok(()) => {
                drop(progress_tx);
                let _ = forwarder.await;
                if !reply.is_empty() {
                    let _ = self
                        .send_message(Message::new(reply, json!({"success": true, "backupId": req.backup_id})))
                        .await;
                }
            }
            Err(e) => {
                warn!("[Restore] Failed for {}: {}", req.server_name, e);
                let _ = progress_tx.send(BackupProgress {
                    backup_id: req.backup_id.clone(),
                    server_name: req.server_name.clone(),
                    phase: "error".into(),
                    percent: 0,
                    error: Some(e.to_string()),
                });
                drop(progress_tx);
                let _ = forwarder.await;
                if !reply.is_empty() {
                    let _ = self
                        .send_message(Message::new(
                            reply,
                            json!({"success": false, "backupId": req.backup_id, "error": e.to_string()}),
                        ))
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn seed_server(base: &Path, name: &str) -> PathBuf {
        let data = base.join(name).join("data");
        fs::create_dir_all(data.join("map")).unwrap();
        fs::write(data.join("server.ini"), "players=12\n").unwrap();
        fs::write(data.join("map/chunk0.bin"), vec![7u8; 2048]).unwrap();
        fs::set_permissions(data.join("map/chunk0.bin"), fs::Permissions::from_mode(0o640)).unwrap();
        data
    }

    fn no_progress(_: BackupProgress) {}

    #[test]
    fn sanitize_label() {
        assert_eq!(sanitize_for_filename("before patch"), "before_patch");
        assert_eq!(sanitize_for_filename("weird/../chars!!"), "weirdchars");
        assert_eq!(sanitize_for_filename(""), "");
        let long = "x".repeat(50);
        assert_eq!(sanitize_for_filename(&long).len(), 30);
    }

    #[test]
    fn filename_validation_rejects_traversal() {
        assert!(validate_filename("ok.tar.gz").is_ok());
        assert!(validate_filename("../escape.tar.gz").is_err());
        assert!(validate_filename("a/b.tar.gz").is_err());
    }

    #[test]
    fn create_then_list_backup() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().to_string_lossy().to_string();
        seed_server(tmp.path(), "srv");

        let resp =
            create_backup_archive("srv", &base, "b1", "before patch", true, &no_progress).unwrap();
        assert!(resp.success);
        assert!(resp.filename.ends_with("_before_patch.tar.gz"));
        assert!(resp.size_bytes > 0);
        assert!(resp.pre_save_success);

        let backups = list_backups("srv", &base).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].backup_id, "b1");
        assert_eq!(backups[0].filename, resp.filename);
        assert_eq!(backups[0].notes, "before patch");
    }

    #[test]
    fn create_fails_without_data_dir() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().to_string_lossy().to_string();
        let err = create_backup_archive("ghost", &base, "b1", "", false, &no_progress).unwrap_err();
        assert!(err.to_string().contains("data directory does not exist"));
    }

    #[test]
    fn list_skips_orphaned_sidecars() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().to_string_lossy().to_string();
        seed_server(tmp.path(), "srv");

        let resp = create_backup_archive("srv", &base, "b1", "keep", false, &no_progress).unwrap();
        fs::remove_file(backups_dir(&base, "srv").join(&resp.filename)).unwrap();

        assert!(list_backups("srv", &base).unwrap().is_empty());
    }

    #[test]
    fn delete_removes_archive_and_sidecar() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().to_string_lossy().to_string();
        seed_server(tmp.path(), "srv");

        let resp = create_backup_archive("srv", &base, "b1", "", false, &no_progress).unwrap();
        delete_backup("srv", &base, &resp.filename).unwrap();

        let dir = backups_dir(&base, "srv");
        assert!(!dir.join(&resp.filename).exists());
        assert!(!meta_path_for(&dir, &resp.filename).exists());

        // Deleting again is fine; traversal never is.
        delete_backup("srv", &base, &resp.filename).unwrap();
        assert!(delete_backup("srv", &base, "../../etc/passwd").is_err());
    }

    #[test]
    fn retention_keeps_newest_ten() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().to_string_lossy().to_string();
        seed_server(tmp.path(), "srv");
        let dir = backups_dir(&base, "srv");
        fs::create_dir_all(&dir).unwrap();

        // Seed 10 existing backups with distinct ages.
        for i in 0..10 {
            let filename = format!("2024-01-0{}T00-00-00_old{i}.tar.gz", (i % 9) + 1);
            fs::write(dir.join(&filename), b"archive").unwrap();
            let meta = BackupMeta {
                backup_id: format!("old{i}"),
                server_name: "srv".into(),
                filename: filename.clone(),
                size_bytes: 7,
                notes: String::new(),
                pre_save_success: false,
                created_at: 1_700_000_000 + i as i64,
            };
            fs::write(meta_path_for(&dir, &filename), serde_json::to_vec(&meta).unwrap()).unwrap();
        }

        let resp = create_backup_archive("srv", &base, "b11", "newest", false, &no_progress).unwrap();

        let backups = list_backups("srv", &base).unwrap();
        assert_eq!(backups.len(), MAX_BACKUPS_PER_SERVER);
        assert_eq!(backups[0].backup_id, "b11");
        // The oldest (created_at 1_700_000_000) is gone, archive and sidecar.
        assert!(!backups.iter().any(|b| b.backup_id == "old0"));
        let oldest = "2024-01-01T00-00-00_old0.tar.gz";
        assert!(!dir.join(oldest).exists());
        assert!(!meta_path_for(&dir, oldest).exists());
        assert!(dir.join(&resp.filename).exists());
    }

    #[tokio::test]
    async fn backup_restore_roundtrip_is_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().to_string_lossy().to_string();
        let data = seed_server(tmp.path(), "srv");

        let resp = create_backup_archive("srv", &base, "b1", "", false, &no_progress).unwrap();

        // Mutate the live tree after the backup.
        fs::write(data.join("server.ini"), "players=0\n").unwrap();
        fs::remove_file(data.join("map/chunk0.bin")).unwrap();

        let req = BackupRestoreRequest {
            server_name: "srv".into(),
            data_path: base.clone(),
            filename: resp.filename,
            backup_id: "r1".into(),
            container_id: String::new(),
        };
        restore_from_backup(None, &req, |_| {}).await.unwrap();

        assert_eq!(fs::read_to_string(data.join("server.ini")).unwrap(), "players=12\n");
        assert_eq!(fs::read(data.join("map/chunk0.bin")).unwrap(), vec![7u8; 2048]);
        let mode = fs::metadata(data.join("map/chunk0.bin")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);

        // The previous tree is kept as a safety net.
        let kept: Vec<_> = fs::read_dir(tmp.path().join("srv"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("data.pre-restore."))
            .collect();
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn restore_rolls_back_on_corrupt_archive() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().to_string_lossy().to_string();
        let data = seed_server(tmp.path(), "srv");
        let dir = backups_dir(&base, "srv");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("bad.tar.gz"), b"this is not a gzip stream").unwrap();

        let req = BackupRestoreRequest {
            server_name: "srv".into(),
            data_path: base.clone(),
            filename: "bad.tar.gz".into(),
            backup_id: "r1".into(),
            container_id: String::new(),
        };
        let phases = std::sync::Mutex::new(Vec::new());
        let err = restore_from_backup(None, &req, |p| phases.lock().unwrap().push(p.phase))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to extract backup"));

        // Original data back in place; no pre-restore leftovers as data/.
        assert_eq!(fs::read_to_string(data.join("server.ini")).unwrap(), "players=12\n");
        assert!(data.join("map/chunk0.bin").exists());
        assert!(!phases.into_inner().unwrap().contains(&"complete".to_string()));
    }

    #[tokio::test]
    async fn restore_rejects_traversal_entries() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().to_string_lossy().to_string();
        seed_server(tmp.path(), "srv");
        let dir = backups_dir(&base, "srv");
        fs::create_dir_all(&dir).unwrap();

        // Build an archive holding an escaping entry.
        let evil = dir.join("evil.tar.gz");
        {
            let out = fs::File::create(&evil).unwrap();
            let encoder = GzEncoder::new(out, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let payload = b"owned";
            let mut header = tar::Header::new_gnu();
            header.set_size(payload.len() as u64);
            header.set_mode(0o644);
            let name = b"../../escape.txt\0";
            header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
            header.set_cksum();
            builder.append(&header, payload.as_slice()).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let req = BackupRestoreRequest {
            server_name: "srv".into(),
            data_path: base.clone(),
            filename: "evil.tar.gz".into(),
            backup_id: "r1".into(),
            container_id: String::new(),
        };
        let err = restore_from_backup(None, &req, |_| {}).await.unwrap_err();
        assert!(err.to_string().contains("path traversal") || err.to_string().contains("extract"));
        assert!(!tmp.path().join("escape.txt").exists());
        // Rollback restored the original data.
        assert!(tmp.path().join("srv/data/server.ini").exists());
    }

    #[test]
    fn filename_uses_utc_pattern_and_label() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().to_string_lossy().to_string();
        seed_server(tmp.path(), "srv");

        let resp = create_backup_archive("srv", &base, "b1", "", false, &no_progress).unwrap();
        // YYYY-MM-DDTHH-MM-SS_manual.tar.gz
        let re = regex::Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}_manual\.tar\.gz$").unwrap();
        assert!(re.is_match(&resp.filename), "unexpected filename {}", resp.filename);
    }

    #[test]
    fn progress_reaches_complete() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().to_string_lossy().to_string();
        seed_server(tmp.path(), "srv");

        let phases = std::sync::Mutex::new(Vec::new());
        create_backup_archive("srv", &base, "b1", "", false, &|p| {
            phases.lock().unwrap().push((p.phase, p.percent));
        })
        .unwrap();

        let phases = phases.into_inner().unwrap();
        assert_eq!(phases.first().unwrap().0, "calculating");
        let last = phases.last().unwrap();
        assert_eq!(last.0, "complete");
        assert_eq!(last.1, 100);
    }
}
