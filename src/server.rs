use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bollard::container::{Config, CreateContainerOptions, NetworkingConfig};
use bollard::models::{
    EndpointSettings, HostConfig, Mount, MountTypeEnum, PortBinding, PortMap, RestartPolicy,
    RestartPolicyNameEnum,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::docker::{
    self, DockerClient, BACKEND_NETWORK, BIN_MOUNT_TARGET, CONTAINER_NAME_PREFIX, DATA_MOUNT_TARGET,
    MANAGED_LABEL, RCON_ENABLED_LABEL, SERVERS_NETWORK, SERVER_ID_LABEL, SERVER_NAME_LABEL,
    SERVER_TYPE, TYPE_LABEL,
};
use crate::errors::{AgentError, AgentResult};
use crate::message::Message;
use crate::Agent;

/// How long volume-size calculations stay cached per (serverName, dataPath).
pub const VOLUME_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

// ==================== Request / response payloads ====================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCreateRequest {
    #[serde(default)]
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub image_tag: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub game_port: u16,
    #[serde(default)]
    pub udp_port: u16,
    #[serde(default)]
    pub rcon_port: u16,
    #[serde(default)]
    pub data_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDeleteRequest {
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub remove_volumes: bool,
    #[serde(default)]
    pub data_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRebuildRequest {
    pub container_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub image_tag: String,
    #[serde(default)]
    pub config: Option<HashMap<String, String>>,
    #[serde(default)]
    pub game_port: u16,
    #[serde(default)]
    pub udp_port: u16,
    #[serde(default)]
    pub rcon_port: u16,
    #[serde(default)]
    pub data_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAdoptRequest {
    pub container_id: String,
    #[serde(default)]
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub image_tag: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub game_port: u16,
    #[serde(default)]
    pub udp_port: u16,
    #[serde(default)]
    pub rcon_port: u16,
    pub data_path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOperationResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    pub operation: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDataStatus {
    pub server_name: String,
    pub data_exists: bool,
    pub bin_path: String,
    pub data_path: String,
    pub bin_exists: bool,
    pub data_folder_exists: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCheckDataRequest {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub data_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerGetDataPathRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerVolumeSizesRequest {
    pub server_name: String,
    #[serde(default)]
    pub data_path: String,
}

/// Storage usage for a server plus the capacity of the disk it lives on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerVolumeSizes {
    pub bin_bytes: i64,
    pub data_bytes: i64,
    pub total_bytes: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mount_point: String,
    pub disk_total_bytes: i64,
    pub disk_used_bytes: i64,
    pub disk_free_bytes: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMoveDataRequest {
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub old_path: String,
    #[serde(default)]
    pub new_path: String,
}

/// Progress event for data migration and adoption, published on
/// `move.progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveProgress {
    #[serde(default)]
    pub server_name: String,
    pub phase: String,
    pub percent: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    pub bytes_copied: i64,
    pub total_bytes: i64,
    #[serde(default)]
    pub files_copied: i64,
    #[serde(default)]
    pub total_files: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMoveDataResponse {
    pub success: bool,
    pub server_name: String,
    pub old_path: String,
    pub new_path: String,
    pub bytes_moved: i64,
    pub files_moved: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub mount_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInspectResponse {
    pub success: bool,
    pub container_id: String,
    pub container_name: String,
    pub name: String,
    pub image: String,
    pub registry: String,
    pub image_tag: String,
    pub config: HashMap<String, String>,
    pub game_port: u16,
    pub udp_port: u16,
    pub rcon_port: u16,
    pub mounts: Vec<MountInfo>,
    pub networks: Vec<String>,
    pub state: String,
    pub labels: HashMap<String, String>,
}

// ==================== Orchestrator ====================

/// If the tag already carries a `:` it is a full reference; otherwise
/// compose `registry:tag`.
pub fn full_image_reference(registry: &str, image_tag: &str) -> String {
    if image_tag.contains(':') {
        image_tag.to_string()
    } else {
        format!("{registry}:{image_tag}")
    }
}

/// Standard on-disk layout for a server under a base data path.
pub fn server_layout(data_path: &str, name: &str) -> (PathBuf, PathBuf, PathBuf) {
    let base = Path::new(data_path).join(name);
    let bin = base.join("bin");
    let data = base.join("data");
    (base, bin, data)
}

fn managed_labels(server_id: &str, name: &str) -> HashMap<String, String> {
    HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (SERVER_ID_LABEL.to_string(), server_id.to_string()),
        (SERVER_NAME_LABEL.to_string(), name.to_string()),
        (TYPE_LABEL.to_string(), SERVER_TYPE.to_string()),
        (RCON_ENABLED_LABEL.to_string(), "true".to_string()),
    ])
}

fn udp_port_bindings(game_port: u16, udp_port: u16) -> (PortMap, HashMap<String, HashMap<(), ()>>) {
    let mut bindings: PortMap = HashMap::new();
    let mut exposed = HashMap::new();
    for port in [game_port, udp_port] {
        let key = format!("{port}/udp");
        bindings.insert(
            key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.to_string()),
            }]),
        );
        exposed.insert(key, HashMap::new());
    }
    (bindings, exposed)
}

fn bind_mounts(bin_path: &Path, data_path: &Path) -> Vec<Mount> {
    vec![
        Mount {
            typ: Some(MountTypeEnum::BIND),
            source: Some(bin_path.to_string_lossy().to_string()),
            target: Some(BIN_MOUNT_TARGET.to_string()),
            ..Default::default()
        },
        Mount {
            typ: Some(MountTypeEnum::BIND),
            source: Some(data_path.to_string_lossy().to_string()),
            target: Some(DATA_MOUNT_TARGET.to_string()),
            ..Default::default()
        },
    ]
}

fn both_networks() -> NetworkingConfig<String> {
    NetworkingConfig {
        endpoints_config: HashMap::from([
            (SERVERS_NETWORK.to_string(), EndpointSettings::default()),
            (BACKEND_NETWORK.to_string(), EndpointSettings::default()),
        ]),
    }
}

fn env_list(config: &HashMap<String, String>) -> Vec<String> {
    config.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

impl DockerClient {
    async fn create_and_start(
        &self,
        container_name: &str,
        config: Config<String>,
    ) -> AgentResult<String> {
        let created = self
            .cli
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| AgentError::DockerError(format!("failed to create container: {e}")))?;

        info!("Container created: {} (ID: {})", container_name, created.id);

        if let Err(e) = self.start_container(&created.id).await {
            // A created-but-unstartable container must not linger.
            let _ = self.remove_container(&created.id).await;
            return Err(AgentError::DockerError(format!("failed to start container: {e}")));
        }

        Ok(created.id)
    }

    /// Create a game-server container: pull, materialise the on-disk
    /// layout, create with the label schema, and start.
    pub async fn create_server(&self, req: &ServerCreateRequest) -> AgentResult<String> {
        let full_image = full_image_reference(&req.registry, &req.image_tag);
        self.pull_image(&full_image).await?;

        let (base, bin_path, data_path) = server_layout(&req.data_path, &req.name);
        fs::create_dir_all(&bin_path)
            .map_err(|e| AgentError::IoError(format!("failed to create bin directory: {e}")))?;
        fs::create_dir_all(&data_path)
            .map_err(|e| AgentError::IoError(format!("failed to create data directory: {e}")))?;
        info!("Created volume directories: {}", base.display());

        let (port_bindings, exposed_ports) = udp_port_bindings(req.game_port, req.udp_port);
        let config = Config {
            image: Some(full_image.clone()),
            env: Some(env_list(&req.config)),
            labels: Some(managed_labels(&req.server_id, &req.name)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                mounts: Some(bind_mounts(&bin_path, &data_path)),
                port_bindings: Some(port_bindings),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            networking_config: Some(both_networks()),
            ..Default::default()
        };

        let container_name = format!("{CONTAINER_NAME_PREFIX}{}", req.name);
        self.create_and_start(&container_name, config).await
    }

    /// Delete a server container and/or its data tree. With an empty
    /// container id this is a pure data purge (soft-deleted servers).
    pub async fn delete_server(&self, req: &ServerDeleteRequest) -> AgentResult<()> {
        let mut server_name = req.server_name.clone();

        if !req.container_id.is_empty() {
            // Recover the server name from labels when the caller omitted it.
            if server_name.is_empty() {
                match self.inspect(&req.container_id).await {
                    Ok(inspect) => {
                        server_name = inspect
                            .config
                            .and_then(|c| c.labels)
                            .and_then(|labels| labels.get(SERVER_NAME_LABEL).cloned())
                            .unwrap_or_default();
                    }
                    Err(e) => warn!("Failed to inspect container (may not exist): {}", e),
                }
            }

            self.graceful_save(&req.container_id).await;

            if let Err(e) = self.stop_container_raw(&req.container_id).await {
                warn!("Failed to stop container (may already be stopped): {}", e);
            }

            match self.remove_container(&req.container_id).await {
                Ok(()) => info!("Container removed successfully: {}", req.container_id),
                Err(e) => warn!("Failed to remove container (may not exist): {}", e),
            }
        }

        if req.remove_volumes && !server_name.is_empty() && !req.data_path.is_empty() {
            let base = Path::new(&req.data_path).join(&server_name);
            info!("Removing volume directories: {}", base.display());
            fs::remove_dir_all(&base)
                .map_err(|e| AgentError::IoError(format!("failed to remove volumes: {e}")))?;
        } else if !server_name.is_empty() && !req.data_path.is_empty() {
            info!(
                "Volumes preserved at: {}",
                Path::new(&req.data_path).join(&server_name).display()
            );
        } else if req.remove_volumes {
            warn!("Cannot determine server name or data path, skipping volume removal");
        }

        Ok(())
    }

    /// Simple rebuild: preserve the existing configuration, pull the current
    /// image reference, and swap the container. Returns the new id.
    pub async fn rebuild_server(&self, container_id: &str) -> AgentResult<String> {
        info!("Rebuilding server container: {}", container_id);

        let inspect = self.inspect(container_id).await?;
        let config = inspect.config.clone().unwrap_or_default();
        let image = config.image.clone().unwrap_or_default();
        let container_name = inspect
            .name
            .clone()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();

        let networks: Vec<String> = inspect
            .network_settings
            .as_ref()
            .and_then(|n| n.networks.as_ref())
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default();
        let port_bindings = inspect
            .host_config
            .as_ref()
            .and_then(|h| h.port_bindings.clone());
        let mounts = inspect.host_config.as_ref().and_then(|h| h.mounts.clone());

        info!(
            "Container config extracted: image={}, name={}, networks={:?}",
            image, container_name, networks
        );

        self.pull_image(&image).await?;

        self.graceful_save(container_id).await;
        if let Err(e) = self.stop_container_raw(container_id).await {
            warn!("Failed to stop container (may already be stopped): {}", e);
        }
        self.remove_container(container_id).await?;

        let new_config = Config {
            image: Some(image),
            env: config.env,
            labels: config.labels,
            host_config: Some(HostConfig {
                mounts,
                port_bindings,
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: networks
                    .into_iter()
                    .map(|n| (n, EndpointSettings::default()))
                    .collect(),
            }),
            ..Default::default()
        };

        let new_id = self.create_and_start(&container_name, new_config).await?;
        info!("Server rebuild complete: {} -> {}", container_id, new_id);
        Ok(new_id)
    }

    /// Rebuild dispatcher: with-config mode when a new name/registry/env is
    /// provided, simple mode otherwise.
    pub async fn rebuild_server_with_config(&self, req: &ServerRebuildRequest) -> AgentResult<String> {
        if !req.name.is_empty() && !req.registry.is_empty() && req.config.is_some() {
            info!("Rebuilding with new configuration (config update mode)");
            return self.rebuild_with_new_config(req).await;
        }
        info!("Rebuilding with existing configuration (simple rebuild mode)");
        self.rebuild_server(&req.container_id).await
    }

    async fn rebuild_with_new_config(&self, req: &ServerRebuildRequest) -> AgentResult<String> {
        let inspect = self.inspect(&req.container_id).await?;
        let container_name = inspect
            .name
            .clone()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let networks: Vec<String> = inspect
            .network_settings
            .as_ref()
            .and_then(|n| n.networks.as_ref())
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default();

        let full_image = full_image_reference(&req.registry, &req.image_tag);
        self.pull_image(&full_image).await?;

        let (_, bin_path, data_path) = server_layout(&req.data_path, &req.name);
        let (port_bindings, exposed_ports) = udp_port_bindings(req.game_port, req.udp_port);
        let env = req.config.as_ref().map(env_list).unwrap_or_default();

        self.graceful_save(&req.container_id).await;
        if let Err(e) = self.stop_container_raw(&req.container_id).await {
            warn!("Failed to stop container (may already be stopped): {}", e);
        }
        self.remove_container(&req.container_id).await?;

        let config = Config {
            image: Some(full_image),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                mounts: Some(bind_mounts(&bin_path, &data_path)),
                port_bindings: Some(port_bindings),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: networks
                    .into_iter()
                    .map(|n| (n, EndpointSettings::default()))
                    .collect(),
            }),
            ..Default::default()
        };

        let new_id = self.create_and_start(&container_name, config).await?;
        info!("Server rebuild complete: {} -> {}", req.container_id, new_id);
        Ok(new_id)
    }

    /// Adopt an unmanaged container: copy its bind-mounted data into the
    /// standard layout, then replace it with a fully labelled container
    /// pointing at the standard paths. Data is copied, never moved; the old
    /// container survives until the copy has succeeded.
    pub async fn adopt_server(
        &self,
        req: &ServerAdoptRequest,
        progress: impl Fn(MoveProgress) + Clone + Send + Sync + 'static,
    ) -> AgentResult<String> {
        info!(
            "Adopting container {} as server '{}' (dataPath: {})",
            req.container_id, req.name, req.data_path
        );

        let inspect = self.inspect(&req.container_id).await?;
        let was_running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        let mut old_bin_source = String::new();
        let mut old_data_source = String::new();
        for mount in inspect.mounts.clone().unwrap_or_default() {
            match mount.destination.as_deref() {
                Some(BIN_MOUNT_TARGET) => old_bin_source = mount.source.unwrap_or_default(),
                Some(DATA_MOUNT_TARGET) => old_data_source = mount.source.unwrap_or_default(),
                _ => {}
            }
        }
        info!("Existing mounts - bin: {:?}, data: {:?}", old_bin_source, old_data_source);

        let (_, new_bin, new_data) = server_layout(&req.data_path, &req.name);
        let bin_needs_migration =
            !old_bin_source.is_empty() && Path::new(&old_bin_source) != new_bin.as_path();
        let data_needs_migration =
            !old_data_source.is_empty() && Path::new(&old_data_source) != new_data.as_path();

        fs::create_dir_all(&new_bin)
            .map_err(|e| AgentError::IoError(format!("failed to create bin directory: {e}")))?;
        fs::create_dir_all(&new_data)
            .map_err(|e| AgentError::IoError(format!("failed to create data directory: {e}")))?;

        let phase = |name: &str, percent: i64, total: i64, copied: i64| MoveProgress {
            server_name: req.name.clone(),
            phase: name.to_string(),
            percent,
            current_file: None,
            bytes_copied: copied,
            total_bytes: total,
            files_copied: 0,
            total_files: 0,
            error: None,
        };

        if was_running {
            progress(phase("stopping", 0, 0, 0));
            self.graceful_save(&req.container_id).await;
            if let Err(e) = self.stop_container_raw(&req.container_id).await {
                warn!("Failed to stop container: {}", e);
            }
        }

        // Copy phases run off the async executor; progress flows back
        // through the callback.
        let copy_result = {
            let old_bin = old_bin_source.clone();
            let old_data = old_data_source.clone();
            let new_bin = new_bin.clone();
            let new_data = new_data.clone();
            let name = req.name.clone();
            let progress = progress.clone();
            tokio::task::spawn_blocking(move || -> AgentResult<(i64, i64)> {
                let mut total_bytes = 0i64;
                if bin_needs_migration {
                    total_bytes += tree_stats(Path::new(&old_bin))?.0;
                }
                if data_needs_migration {
                    total_bytes += tree_stats(Path::new(&old_data))?.0;
                }

                let mut copied = 0i64;
                if bin_needs_migration {
                    info!("Migrating bin data: {} -> {}", old_bin, new_bin.display());
                    progress(MoveProgress {
                        server_name: name.clone(),
                        phase: "copying-bin".into(),
                        percent: 0,
                        current_file: None,
                        bytes_copied: 0,
                        total_bytes,
                        files_copied: 0,
                        total_files: 0,
                        error: None,
                    });
                    copy_tree(Path::new(&old_bin), &new_bin, &mut |file_bytes| {
                        copied += file_bytes;
                        if total_bytes > 0 {
                            progress(MoveProgress {
                                server_name: name.clone(),
                                phase: "copying-bin".into(),
                                percent: copied * 100 / total_bytes,
                                current_file: None,
                                bytes_copied: copied,
                                total_bytes,
                                files_copied: 0,
                                total_files: 0,
                                error: None,
                            });
                        }
                    })
                    .map_err(|e| AgentError::MigrationError(format!("failed to migrate bin data: {e}")))?;
                }
                if data_needs_migration {
                    info!("Migrating game data: {} -> {}", old_data, new_data.display());
                    progress(MoveProgress {
                        server_name: name.clone(),
                        phase: "copying-data".into(),
                        percent: if total_bytes > 0 { copied * 100 / total_bytes } else { 0 },
                        current_file: None,
                        bytes_copied: copied,
                        total_bytes,
                        files_copied: 0,
                        total_files: 0,
                        error: None,
                    });
                    let result = copy_tree(Path::new(&old_data), &new_data, &mut |file_bytes| {
                        copied += file_bytes;
                        if total_bytes > 0 {
                            progress(MoveProgress {
                                server_name: name.clone(),
                                phase: "copying-data".into(),
                                percent: copied * 100 / total_bytes,
                                current_file: None,
                                bytes_copied: copied,
                                total_bytes,
                                files_copied: 0,
                                total_files: 0,
                                error: None,
                            });
                        }
                    });
                    if let Err(e) = result {
                        // Undo the partial bin copy before failing; the old
                        // container is still intact at this point.
                        if bin_needs_migration {
                            let _ = fs::remove_dir_all(&new_bin);
                            let _ = fs::create_dir_all(&new_bin);
                        }
                        return Err(AgentError::MigrationError(format!(
                            "failed to migrate game data: {e}"
                        )));
                    }
                }
                Ok((total_bytes, copied))
            })
            .await
            .map_err(|e| AgentError::InternalError(format!("copy task failed: {e}")))?
        };
        let (total_bytes, bytes_copied) = copy_result?;

        progress(phase("creating-container", 95, total_bytes, bytes_copied));
        info!("Removing old container: {}", req.container_id);
        self.remove_container(&req.container_id).await?;

        let full_image = full_image_reference(&req.registry, &req.image_tag);
        let (port_bindings, exposed_ports) = udp_port_bindings(req.game_port, req.udp_port);
        let config = Config {
            image: Some(full_image),
            env: Some(env_list(&req.config)),
            labels: Some(managed_labels(&req.server_id, &req.name)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                mounts: Some(bind_mounts(&new_bin, &new_data)),
                port_bindings: Some(port_bindings),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            networking_config: Some(both_networks()),
            ..Default::default()
        };

        let container_name = format!("{CONTAINER_NAME_PREFIX}{}", req.name);
        let new_id = self.create_and_start(&container_name, config).await?;

        info!("Adopted container started: {} (dataPath: {})", new_id, req.data_path);
        progress(phase("complete", 100, total_bytes, bytes_copied));
        Ok(new_id)
    }

    /// Full container inspection used by the adoption UI.
    pub async fn inspect_server(&self, container_id: &str) -> AgentResult<ServerInspectResponse> {
        let inspect = self.inspect(container_id).await?;

        let container_name = inspect
            .name
            .clone()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let name = container_name
            .strip_prefix(CONTAINER_NAME_PREFIX)
            .unwrap_or(&container_name)
            .to_string();

        let full_image = inspect
            .config
            .as_ref()
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        let (registry, image_tag) = match full_image.rfind(':') {
            Some(idx) => (full_image[..idx].to_string(), full_image[idx + 1..].to_string()),
            None => (full_image.clone(), "latest".to_string()),
        };

        let config = docker::parse_env_list(
            &inspect
                .config
                .as_ref()
                .and_then(|c| c.env.clone())
                .unwrap_or_default(),
        );

        // Recover game/UDP ports from the UDP bindings, sorted so
        // gamePort <= udpPort.
        let mut game_port: u16 = 0;
        let mut udp_port: u16 = 0;
        if let Some(bindings) = inspect.host_config.as_ref().and_then(|h| h.port_bindings.as_ref()) {
            for (port_proto, binding) in bindings {
                let Some(port_str) = port_proto.strip_suffix("/udp") else {
                    continue;
                };
                let Ok(port) = port_str.parse::<u16>() else {
                    continue;
                };
                let host_port = binding
                    .as_ref()
                    .and_then(|b| b.first())
                    .and_then(|b| b.host_port.as_ref())
                    .and_then(|p| p.parse::<u16>().ok())
                    .unwrap_or(port);
                if game_port == 0 {
                    game_port = host_port;
                } else if udp_port == 0 {
                    udp_port = host_port;
                }
            }
        }
        if game_port > 0 && udp_port > 0 && game_port > udp_port {
            std::mem::swap(&mut game_port, &mut udp_port);
        }

        let rcon_port = config
            .get("RCON_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(27015);

        let mounts = inspect
            .mounts
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|m| MountInfo {
                source: m.source.unwrap_or_default(),
                target: m.destination.unwrap_or_default(),
                mount_type: m.typ.map(|t| t.to_string()).unwrap_or_default(),
            })
            .collect();

        let networks = inspect
            .network_settings
            .as_ref()
            .and_then(|n| n.networks.as_ref())
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default();

        let state = inspect
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default();

        Ok(ServerInspectResponse {
            success: true,
            container_id: inspect.id.unwrap_or_default(),
            container_name,
            name,
            image: full_image,
            registry,
            image_tag,
            config,
            game_port,
            udp_port,
            rcon_port,
            mounts,
            networks,
            state,
            labels: inspect
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default(),
        })
    }

    /// Derive the base data path from a container's bin mount: the source is
    /// `{base}/{name}/bin`, so strip the last two components.
    pub async fn get_container_data_path(&self, container_id: &str) -> AgentResult<String> {
        let inspect = self.inspect(container_id).await?;
        for mount in inspect.mounts.unwrap_or_default() {
            if mount.destination.as_deref() == Some(BIN_MOUNT_TARGET) {
                let bin_path = mount.source.unwrap_or_default();
                let server_path = bin_path.trim_end_matches("/bin");
                let base = Path::new(server_path)
                    .parent()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();
                info!(
                    "Extracted data path from container mounts: {} (from bin mount: {})",
                    base, bin_path
                );
                return Ok(base);
            }
        }
        Err(AgentError::NotFound(format!(
            "no bin mount found in container (expected mount at {BIN_MOUNT_TARGET})"
        )))
    }
}

// ==================== Filesystem helpers ====================

pub fn dir_exists(path: &Path) -> bool {
    path.is_dir()
}

/// Existence report for a server's standard layout.
pub fn check_server_data(server_name: &str, data_path: &str) -> ServerDataStatus {
    let (_, bin, data) = server_layout(data_path, server_name);
    let bin_exists = dir_exists(&bin);
    let data_folder_exists = dir_exists(&data);
    ServerDataStatus {
        server_name: server_name.to_string(),
        data_exists: bin_exists || data_folder_exists,
        bin_path: bin.to_string_lossy().to_string(),
        data_path: data.to_string_lossy().to_string(),
        bin_exists,
        data_folder_exists,
    }
}

/// Total bytes and file count of a tree. Permission errors on individual
/// entries are skipped.
pub fn tree_stats(dir: &Path) -> AgentResult<(i64, i64)> {
    let mut bytes = 0i64;
    let mut files = 0i64;
    walk_entries(dir, &mut |_, meta| {
        if meta.is_file() {
            bytes += meta.len() as i64;
            files += 1;
        }
        Ok(())
    })?;
    Ok((bytes, files))
}

/// Depth-first walk over every entry under `dir` (the root itself is not
/// visited). Entries whose metadata is unreadable are skipped.
pub fn walk_entries(
    dir: &Path,
    visit: &mut dyn FnMut(&Path, &fs::Metadata) -> std::io::Result<()>,
) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => continue,
            Err(e) => return Err(e),
        };
        visit(&path, &meta)?;
        if meta.is_dir() {
            walk_entries(&path, visit)?;
        }
    }
    Ok(())
}

/// Copy all files from `src` into `dst` recursively, preserving modes.
/// `on_file` is invoked with each copied file's size.
pub fn copy_tree(
    src: &Path,
    dst: &Path,
    on_file: &mut dyn FnMut(i64),
) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let target = dst.join(entry.file_name());
        if meta.is_dir() {
            fs::create_dir_all(&target)?;
            fs::set_permissions(&target, fs::Permissions::from_mode(meta.permissions().mode()))?;
            copy_tree(&entry.path(), &target, on_file)?;
        } else if meta.is_file() {
            fs::copy(entry.path(), &target)?;
            on_file(meta.len() as i64);
        }
    }
    Ok(())
}

/// Copy-then-delete migration of `{old_base}/{name}` to `{new_base}/{name}`
/// with verification and cleanup-on-failure. Runs synchronously; callers
/// wrap it in `spawn_blocking`.
pub fn move_server_data(
    server_name: &str,
    old_base: &str,
    new_base: &str,
    progress: &dyn Fn(MoveProgress),
) -> AgentResult<ServerMoveDataResponse> {
    let src = Path::new(old_base).join(server_name);
    let dst = Path::new(new_base).join(server_name);

    info!("Moving server data: {} -> {}", src.display(), dst.display());

    if !dir_exists(&src) {
        return Err(AgentError::MigrationError(format!(
            "source directory does not exist: {}",
            src.display()
        )));
    }
    if dir_exists(&dst) {
        return Err(AgentError::MigrationError(format!(
            "destination directory already exists: {}",
            dst.display()
        )));
    }
    fs::create_dir_all(new_base)
        .map_err(|e| AgentError::IoError(format!("failed to create destination parent directory: {e}")))?;

    let report = |phase: &str, percent: i64, copied: i64, total: i64, files: i64, total_files: i64| {
        progress(MoveProgress {
            server_name: server_name.to_string(),
            phase: phase.to_string(),
            percent,
            current_file: None,
            bytes_copied: copied,
            total_bytes: total,
            files_copied: files,
            total_files,
            error: None,
        });
    };

    report("calculating", 0, 0, 0, 0, 0);
    let (total_bytes, total_files) = tree_stats(&src)
        .map_err(|e| AgentError::MigrationError(format!("failed to calculate source size: {e}")))?;
    info!("Source size: {} bytes, {} files", total_bytes, total_files);

    report("copying", 0, 0, total_bytes, 0, total_files);

    let mut bytes_copied = 0i64;
    let mut files_copied = 0i64;
    let copy_result = copy_tree(&src, &dst, &mut |file_bytes| {
        bytes_copied += file_bytes;
        files_copied += 1;
        // Progress every 100 files keeps the event stream bounded.
        if files_copied % 100 == 0 {
            let percent = if total_bytes > 0 { bytes_copied * 100 / total_bytes } else { 0 };
            progress(MoveProgress {
                server_name: server_name.to_string(),
                phase: "copying".to_string(),
                percent,
                current_file: None,
                bytes_copied,
                total_bytes,
                files_copied,
                total_files,
                error: None,
            });
        }
    });

    if let Err(e) = copy_result {
        warn!("Copy failed, cleaning up partial destination: {}", dst.display());
        let _ = fs::remove_dir_all(&dst);
        return Err(AgentError::MigrationError(format!("failed to copy data: {e}")));
    }
    info!("Copy complete: {} files, {} bytes", files_copied, bytes_copied);

    report("verifying", 95, bytes_copied, total_bytes, files_copied, total_files);
    let (_, dst_files) = tree_stats(&dst)
        .map_err(|e| AgentError::MigrationError(format!("failed to verify destination: {e}")))?;
    if dst_files != total_files {
        warn!(
            "File count mismatch after copy: expected {}, got {}",
            total_files, dst_files
        );
        let _ = fs::remove_dir_all(&dst);
        return Err(AgentError::MigrationError(format!(
            "copy verification failed: file count mismatch (expected {total_files}, got {dst_files})"
        )));
    }

    report("cleaning", 98, bytes_copied, total_bytes, files_copied, total_files);
    info!("Removing source directory: {}", src.display());
    if let Err(e) = fs::remove_dir_all(&src) {
        // Data is already safely copied; a stuck source is not fatal.
        warn!("Failed to remove source directory (data already copied): {}", e);
    }

    report("complete", 100, bytes_copied, total_bytes, files_copied, total_files);

    Ok(ServerMoveDataResponse {
        success: true,
        server_name: server_name.to_string(),
        old_path: src.to_string_lossy().to_string(),
        new_path: dst.to_string_lossy().to_string(),
        bytes_moved: bytes_copied,
        files_moved: files_copied,
    })
}

/// Storage usage for a server's bin/ and data/ plus capacity of the
/// filesystem backing the base path.
pub fn get_server_volume_sizes(server_name: &str, data_path: &str) -> AgentResult<ServerVolumeSizes> {
    let (_, bin, data) = server_layout(data_path, server_name);

    let bin_bytes = if bin.exists() { tree_stats(&bin)?.0 } else { 0 };
    let data_bytes = if data.exists() { tree_stats(&data)?.0 } else { 0 };

    let (disk_total, disk_used, disk_free) = match nix::sys::statvfs::statvfs(data_path) {
        Ok(stat) => {
            let frsize = stat.fragment_size() as i64;
            let total = stat.blocks() as i64 * frsize;
            let free = stat.blocks_available() as i64 * frsize;
            let used = total - stat.blocks_free() as i64 * frsize;
            (total, used, free)
        }
        Err(e) => {
            warn!("Failed to get disk stats for {}: {}", data_path, e);
            (0, 0, 0)
        }
    };

    Ok(ServerVolumeSizes {
        bin_bytes,
        data_bytes,
        total_bytes: bin_bytes + data_bytes,
        mount_point: data_path.to_string(),
        disk_total_bytes: disk_total,
        disk_used_bytes: disk_used,
        disk_free_bytes: disk_free,
    })
}

// ==================== Handlers ====================

impl Agent {
    pub(crate) async fn send_server_success(&self, server_id: &str, container_id: &str, operation: &str, reply: &str) {
        let subject = if reply.is_empty() { "server.operation.success" } else { reply };
        let response = Message::new(
            subject,
            ServerOperationResponse {
                success: true,
                server_id: server_id.to_string(),
                container_id: container_id.to_string(),
                operation: operation.to_string(),
                error: String::new(),
                error_code: String::new(),
            },
        );
        let _ = self.send_message(response).await;
    }

    pub(crate) async fn send_server_error(
        &self,
        server_id: &str,
        container_id: &str,
        operation: &str,
        error: &str,
        error_code: &str,
        reply: &str,
    ) {
        let subject = if reply.is_empty() { "server.operation.error" } else { reply };
        let response = Message::new(
            subject,
            ServerOperationResponse {
                success: false,
                server_id: server_id.to_string(),
                container_id: container_id.to_string(),
                operation: operation.to_string(),
                error: error.to_string(),
                error_code: error_code.to_string(),
            },
        );
        let _ = self.send_message(response).await;
    }

    pub(crate) async fn handle_server_create(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let Some(docker) = self.docker.clone() else {
            self.send_server_error("", "", "create", "Docker client not initialized", "DOCKER_NOT_AVAILABLE", &reply)
                .await;
            return;
        };

        let mut req: ServerCreateRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                self.send_server_error("", "", "create", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };

        req.data_path = req.data_path.trim().to_string();
        if !req.data_path.starts_with('/') {
            self.send_server_error(
                &req.server_id,
                "",
                "create",
                "dataPath must be an absolute path (start with /)",
                "INVALID_DATA_PATH",
                &reply,
            )
            .await;
            return;
        }

        info!(
            "Creating server: {} (registry: {}, tag: {})",
            req.name, req.registry, req.image_tag
        );

        let container_id = match docker.create_server(&req).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to create server {}: {}", req.name, e);
                self.send_server_error(&req.server_id, "", "create", &e.to_string(), "SERVER_CREATE_FAILED", &reply)
                    .await;
                return;
            }
        };

        // Report the resolved full image reference; the requested tag may
        // have been shorthand.
        let resolved_image = match docker.inspect(&container_id).await {
            Ok(inspect) => inspect
                .config
                .and_then(|c| c.image)
                .unwrap_or_else(|| req.image_tag.clone()),
            Err(e) => {
                warn!("Failed to inspect container for image name: {}", e);
                req.image_tag.clone()
            }
        };

        info!("Server created successfully: {} (container: {})", req.name, container_id);
        let response = Message::new(
            msg.reply_subject("server.operation.success"),
            json!({
                "success": true,
                "serverId": req.server_id,
                "containerId": container_id,
                "imageName": resolved_image,
                "operation": "create",
            }),
        );
        let _ = self.send_message(response).await;
    }

    pub(crate) async fn handle_server_delete(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let Some(docker) = self.docker.clone() else {
            self.send_server_error("", "", "delete", "Docker client not initialized", "DOCKER_NOT_AVAILABLE", &reply)
                .await;
            return;
        };

        let req: ServerDeleteRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                self.send_server_error("", "", "delete", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };

        info!(
            "Deleting server: containerID={}, serverName={}, removeVolumes={}, dataPath={}",
            req.container_id, req.server_name, req.remove_volumes, req.data_path
        );

        if let Err(e) = docker.delete_server(&req).await {
            warn!("Failed to delete server (container={}, name={}): {}", req.container_id, req.server_name, e);
            self.send_server_error("", &req.container_id, "delete", &e.to_string(), "SERVER_DELETE_FAILED", &reply)
                .await;
            return;
        }

        info!("Server deleted successfully: {}", req.server_name);
        self.send_server_success("", &req.container_id, "delete", &reply).await;
    }

    pub(crate) async fn handle_server_rebuild(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let Some(docker) = self.docker.clone() else {
            self.send_server_error("", "", "rebuild", "Docker client not initialized", "DOCKER_NOT_AVAILABLE", &reply)
                .await;
            return;
        };

        let req: ServerRebuildRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                self.send_server_error("", "", "rebuild", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };

        info!("Rebuilding server container: {}", req.container_id);

        let new_id = match docker.rebuild_server_with_config(&req).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to rebuild server {}: {}", req.container_id, e);
                self.send_server_error("", &req.container_id, "rebuild", &e.to_string(), "SERVER_REBUILD_FAILED", &reply)
                    .await;
                return;
            }
        };

        info!("Server rebuilt successfully: {} -> {}", req.container_id, new_id);
        if !reply.is_empty() {
            let response = Message::new(
                reply,
                json!({
                    "success": true,
                    "oldContainerID": req.container_id,
                    "newContainerID": new_id,
                    "operation": "rebuild",
                }),
            );
            let _ = self.send_message(response).await;
        }
    }

    pub(crate) async fn handle_server_adopt(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let Some(docker) = self.docker.clone() else {
            self.send_server_error("", "", "adopt", "Docker client not initialized", "DOCKER_NOT_AVAILABLE", &reply)
                .await;
            return;
        };

        let req: ServerAdoptRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                self.send_server_error("", "", "adopt", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel::<MoveProgress>();
        let forwarder = {
            let agent = self.clone();
            tokio::spawn(async move {
                while let Some(progress) = progress_rx.recv().await {
                    let _ = agent.send_message(Message::new("move.progress", progress)).await;
                }
            })
        };

        let result = docker
            .adopt_server(&req, move |progress| {
                let _ = progress_tx.send(progress);
            })
            .await;
        let _ = forwarder.await;

        match result {
            Ok(new_id) => {
                info!("Server adopted successfully: {} -> {}", req.container_id, new_id);
                if !reply.is_empty() {
                    let response = Message::new(
                        reply,
                        json!({
                            "success": true,
                            "serverId": req.server_id,
                            "containerId": new_id,
                            "dataPath": req.data_path,
                            "operation": "adopt",
                        }),
                    );
                    let _ = self.send_message(response).await;
                }
            }
            Err(e) => {
                warn!("Failed to adopt server {}: {}", req.container_id, e);
                self.send_server_error(&req.server_id, &req.container_id, "adopt", &e.to_string(), "SERVER_ADOPT_FAILED", &reply)
                    .await;
            }
        }
    }

    pub(crate) async fn handle_server_inspect(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        if reply.is_empty() {
            return;
        }
        let Some(docker) = self.docker.clone() else {
            let _ = self
                .send_message(Message::new(
                    reply,
                    json!({"success": false, "error": "Docker client not initialized"}),
                ))
                .await;
            return;
        };

        let req: ServerGetDataPathRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(e) => {
                let _ = self
                    .send_message(Message::new(
                        reply,
                        json!({"success": false, "error": format!("Invalid request format: {e}")}),
                    ))
                    .await;
                return;
            }
        };

        match docker.inspect_server(&req.container_id).await {
            Ok(response) => {
                let _ = self.send_message(Message::new(reply, response)).await;
            }
            Err(e) => {
                let _ = self
                    .send_message(Message::new(reply, json!({"success": false, "error": e.to_string()})))
                    .await;
            }
        }
    }

    pub(crate) async fn handle_server_check_data(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        if reply.is_empty() {
            return;
        }

        let req: ServerCheckDataRequest = match msg.parse_data() {
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

        info!("Checking data existence for {} server(s)", req.servers.len());
        let statuses: Vec<ServerDataStatus> = req
            .servers
            .iter()
            .map(|name| check_server_data(name, &req.data_path))
            .collect();

        let _ = self
            .send_message(Message::new(reply, json!({"success": true, "statuses": statuses})))
            .await;
    }

    pub(crate) async fn handle_server_get_data_path(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        if reply.is_empty() {
            return;
        }
        let Some(docker) = self.docker.clone() else {
            let _ = self
                .send_message(Message::new(
                    reply,
                    json!({"success": false, "error": "Docker client not initialized"}),
                ))
                .await;
            return;
        };

        let req: ServerGetDataPathRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(e) => {
                let _ = self
                    .send_message(Message::new(
                        reply,
                        json!({"success": false, "error": format!("Invalid request format: {e}")}),
                    ))
                    .await;
                return;
            }
        };

        info!("Getting data path from container: {}", req.container_id);
        let response = match docker.get_container_data_path(&req.container_id).await {
            Ok(data_path) => json!({"success": true, "dataPath": data_path}),
            Err(e) => json!({"success": false, "error": e.to_string()}),
        };
        let _ = self.send_message(Message::new(reply, response)).await;
    }

    pub(crate) async fn handle_server_volume_sizes(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        if reply.is_empty() {
            return;
        }

        let req: ServerVolumeSizesRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(e) => {
                let _ = self
                    .send_message(Message::new(
                        reply,
                        json!({"success": false, "error": format!("Invalid request format: {e}")}),
                    ))
                    .await;
                return;
            }
        };

        info!(
            "Getting volume sizes for server: {} (dataPath: {})",
            req.server_name, req.data_path
        );

        let cache_key = format!("{}:{}", req.server_name, req.data_path);
        {
            let cache = self.volume_cache.read().await;
            if let Some((sizes, stored_at)) = cache.get(&cache_key) {
                if stored_at.elapsed() < VOLUME_CACHE_TTL {
                    info!("Returning cached volume sizes for {}", req.server_name);
                    let _ = self
                        .send_message(Message::new(reply, json!({"success": true, "sizes": sizes})))
                        .await;
                    return;
                }
            }
        }

        let server_name = req.server_name.clone();
        let data_path = req.data_path.clone();
        let result = tokio::task::spawn_blocking(move || get_server_volume_sizes(&server_name, &data_path))
            .await
            .unwrap_or_else(|e| Err(AgentError::InternalError(format!("size task failed: {e}"))));

        match result {
            Ok(sizes) => {
                info!(
                    "Volume sizes for {}: bin={} bytes, data={} bytes, total={} bytes",
                    req.server_name, sizes.bin_bytes, sizes.data_bytes, sizes.total_bytes
                );
                self.volume_cache
                    .write()
                    .await
                    .insert(cache_key, (sizes.clone(), Instant::now()));
                let _ = self
                    .send_message(Message::new(reply, json!({"success": true, "sizes": sizes})))
                    .await;
            }
            Err(e) => {
                let _ = self
                    .send_message(Message::new(reply, json!({"success": false, "error": e.to_string()})))
                    .await;
            }
        }
    }

    pub(crate) async fn handle_server_move_data(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();

        let fail = |error: String| {
            json!({
                "success": false,
                "error": error,
            })
        };

        let mut req: ServerMoveDataRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(e) => {
                if !reply.is_empty() {
                    let _ = self
                        .send_message(Message::new(reply, fail(format!("Invalid request format: {e}"))))
                        .await;
                }
                return;
            }
        };

        if req.server_name.is_empty() || req.old_path.is_empty() || req.new_path.is_empty() {
            if !reply.is_empty() {
                let _ = self
                    .send_message(Message::new(
                        reply,
                        fail("serverName, oldPath, and newPath are required".to_string()),
                    ))
                    .await;
            }
            return;
        }

        req.old_path = req.old_path.trim().to_string();
        req.new_path = req.new_path.trim().to_string();
        if !req.old_path.starts_with('/') || !req.new_path.starts_with('/') {
            if !reply.is_empty() {
                let _ = self
                    .send_message(Message::new(
                        reply,
                        fail("oldPath and newPath must be absolute paths (start with /)".to_string()),
                    ))
                    .await;
            }
            return;
        }

        info!(
            "Moving server data: {} from {} to {}",
            req.server_name, req.old_path, req.new_path
        );

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel::<MoveProgress>();
        let forwarder = {
            let agent = self.clone();
            tokio::spawn(async move {
                while let Some(progress) = progress_rx.recv().await {
                    let _ = agent.send_message(Message::new("move.progress", progress)).await;
                }
            })
        };

        let (server_name, old_path, new_path) =
            (req.server_name.clone(), req.old_path.clone(), req.new_path.clone());
        let result = tokio::task::spawn_blocking(move || {
            move_server_data(&server_name, &old_path, &new_path, &|progress| {
                let _ = progress_tx.send(progress);
            })
        })
        .await
        .unwrap_or_else(|e| Err(AgentError::InternalError(format!("move task failed: {e}"))));
        let _ = forwarder.await;

        match result {
            Ok(response) => {
                info!(
                    "Server data moved successfully: {} ({} files, {} bytes)",
                    req.server_name, response.files_moved, response.bytes_moved
                );
                if !reply.is_empty() {
                    let _ = self.send_message(Message::new(reply, response)).await;
                }
            }
            Err(e) => {
                warn!("Failed to move server data: {}", e);
                if !reply.is_empty() {
                    let _ = self
                        .send_message(Message::new(
                            reply,
                            json!({
                                "success": false,
                                "serverName": req.server_name,
                                "oldPath": req.old_path,
                                "newPath": req.new_path,
                                "error": e.to_string(),
                            }),
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

    fn write_file(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn image_reference_composition() {
        assert_eq!(full_image_reference("registry.io/pz", "1.2.3"), "registry.io/pz:1.2.3");
        assert_eq!(
            full_image_reference("ignored", "registry.io/pz:latest"),
            "registry.io/pz:latest"
        );
    }

    #[test]
    fn layout_paths() {
        let (base, bin, data) = server_layout("/srv", "pz1");
        assert_eq!(base, Path::new("/srv/pz1"));
        assert_eq!(bin, Path::new("/srv/pz1/bin"));
        assert_eq!(data, Path::new("/srv/pz1/data"));
    }

    #[test]
    fn managed_labels_schema() {
        let labels = managed_labels("s1", "pz1");
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.get(SERVER_ID_LABEL).map(String::as_str), Some("s1"));
        assert_eq!(labels.get(SERVER_NAME_LABEL).map(String::as_str), Some("pz1"));
        assert_eq!(labels.get(TYPE_LABEL).map(String::as_str), Some(SERVER_TYPE));
    }

    #[test]
    fn udp_bindings_cover_both_ports() {
        let (bindings, exposed) = udp_port_bindings(16261, 16262);
        assert!(bindings.contains_key("16261/udp"));
        assert!(bindings.contains_key("16262/udp"));
        assert_eq!(
            bindings["16261/udp"].as_ref().unwrap()[0].host_port.as_deref(),
            Some("16261")
        );
        assert!(exposed.contains_key("16262/udp"));
    }

    #[test]
    fn check_server_data_reports_partial_layout() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().to_string_lossy().to_string();

        let status = check_server_data("pz1", &base);
        assert!(!status.data_exists);

        fs::create_dir_all(tmp.path().join("pz1/bin")).unwrap();
        let status = check_server_data("pz1", &base);
        assert!(status.data_exists);
        assert!(status.bin_exists);
        assert!(!status.data_folder_exists);
    }

    #[test]
    fn move_data_roundtrip_preserves_tree() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        let src = a.join("pz1");
        write_file(&src.join("data/map/chunk0.bin"), "chunk-zero");
        write_file(&src.join("data/server.ini"), "players=12");
        write_file(&src.join("bin/start.sh"), "#!/bin/sh\n");
        fs::set_permissions(src.join("bin/start.sh"), fs::Permissions::from_mode(0o755)).unwrap();

        let (orig_bytes, orig_files) = tree_stats(&src).unwrap();

        let result = move_server_data("pz1", &a.to_string_lossy(), &b.to_string_lossy(), &|_| {}).unwrap();
        assert!(result.success);
        assert_eq!(result.files_moved, orig_files);
        assert_eq!(result.bytes_moved, orig_bytes);
        assert!(!src.exists());
        assert_eq!(
            fs::read_to_string(b.join("pz1/data/map/chunk0.bin")).unwrap(),
            "chunk-zero"
        );
        let mode = fs::metadata(b.join("pz1/bin/start.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        // And back again.
        let result = move_server_data("pz1", &b.to_string_lossy(), &a.to_string_lossy(), &|_| {}).unwrap();
        let (bytes, files) = tree_stats(&a.join("pz1")).unwrap();
        assert_eq!(bytes, orig_bytes);
        assert_eq!(files, orig_files);
        assert_eq!(result.files_moved, orig_files);
    }

    #[test]
    fn move_data_emits_expected_phases() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        write_file(&a.join("pz1/data/save.bin"), "data");

        let phases = std::sync::Mutex::new(Vec::new());
        move_server_data("pz1", &a.to_string_lossy(), &b.to_string_lossy(), &|p| {
            phases.lock().unwrap().push(p.phase);
        })
        .unwrap();

        let phases = phases.into_inner().unwrap();
        assert_eq!(phases, vec!["calculating", "copying", "verifying", "cleaning", "complete"]);
    }

    #[test]
    fn move_data_rejects_missing_source_and_existing_destination() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");

        assert!(move_server_data("pz1", &a.to_string_lossy(), &b.to_string_lossy(), &|_| {}).is_err());

        write_file(&a.join("pz1/data/x"), "x");
        fs::create_dir_all(b.join("pz1")).unwrap();
        let err = move_server_data("pz1", &a.to_string_lossy(), &b.to_string_lossy(), &|_| {})
            .unwrap_err()
            .to_string();
        assert!(err.contains("already exists"));
        // Source untouched on failure.
        assert!(a.join("pz1/data/x").exists());
    }

    #[test]
    fn tree_stats_counts_files_only() {
        let tmp = TempDir::new().unwrap();
        write_file(&tmp.path().join("x/y/file1"), "12345");
        write_file(&tmp.path().join("file2"), "abc");
        let (bytes, files) = tree_stats(tmp.path()).unwrap();
        assert_eq!(bytes, 8);
        assert_eq!(files, 2);
    }

    #[test]
    fn volume_sizes_include_disk_capacity() {
        let tmp = TempDir::new().unwrap();
        write_file(&tmp.path().join("pz1/bin/server"), "0123456789");
        write_file(&tmp.path().join("pz1/data/map"), "01234");

        let sizes = get_server_volume_sizes("pz1", &tmp.path().to_string_lossy()).unwrap();
        assert_eq!(sizes.bin_bytes, 10);
        assert_eq!(sizes.data_bytes, 5);
        assert_eq!(sizes.total_bytes, 15);
        assert!(sizes.disk_total_bytes > 0);
        assert!(sizes.disk_free_bytes <= sizes.disk_total_bytes);
    }
}
