use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{ContainerInspectResponse, HealthStatusEnum};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{AgentError, AgentResult};
use crate::rcon::{self, RconConnection};

/// Label schema for containers under agent management.
pub const MANAGED_LABEL: &str = "zedops.managed";
pub const SERVER_ID_LABEL: &str = "zedops.server.id";
pub const SERVER_NAME_LABEL: &str = "zedops.server.name";
pub const TYPE_LABEL: &str = "zedops.type";
pub const RCON_ENABLED_LABEL: &str = "pz.rcon.enabled";
pub const SERVER_TYPE: &str = "project-zomboid";

/// OCI image-version label (read-through, never set by the agent).
pub const IMAGE_VERSION_LABEL: &str = "org.opencontainers.image.version";

/// Internal bridge networks every managed server joins.
pub const BACKEND_NETWORK: &str = "zomboid-backend";
pub const SERVERS_NETWORK: &str = "zomboid-servers";

/// Fixed in-container paths the host layout binds onto.
pub const BIN_MOUNT_TARGET: &str = "/home/steam/zomboid-dedicated";
pub const DATA_MOUNT_TARGET: &str = "/home/steam/Zomboid";

pub const CONTAINER_NAME_PREFIX: &str = "steam-zomboid-";

/// Docker stop timeout applied after the RCON save (seconds).
pub const GRACEFUL_STOP_TIMEOUT: i64 = 30;

/// Flush window after a successful pre-stop save.
const SAVE_FLUSH_WAIT: Duration = Duration::from_secs(3);

/// Container metadata returned by `container.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    #[serde(rename = "image_version", skip_serializing_if = "Option::is_none")]
    pub image_version: Option<String>,
    pub state: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
    pub created: i64,
    pub ports: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub private_port: u16,
    pub public_port: u16,
    #[serde(rename = "type")]
    pub protocol: String,
}

/// One log line from a container's multiplexed output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub container_id: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// "stdout" or "stderr".
    pub stream: String,
    pub message: String,
}

/// One-shot container resource snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetrics {
    pub container_id: String,
    pub cpu_percent: f64,
    #[serde(rename = "memoryUsedMB")]
    pub memory_used_mb: i64,
    #[serde(rename = "memoryLimitMB")]
    pub memory_limit_mb: i64,
    #[serde(rename = "diskReadMB")]
    pub disk_read_mb: i64,
    #[serde(rename = "diskWriteMB")]
    pub disk_write_mb: i64,
    pub uptime: String,
    pub uptime_seconds: i64,
}

/// Thin seam over the Docker daemon.
pub struct DockerClient {
    pub(crate) cli: Docker,
}

impl DockerClient {
    pub fn new() -> AgentResult<Self> {
        let cli = Docker::connect_with_local_defaults()
            .map_err(|e| AgentError::DockerError(format!("failed to create Docker client: {e}")))?;
        Ok(Self { cli })
    }

    pub async fn ping(&self) -> AgentResult<()> {
        self.cli
            .ping()
            .await
            .map_err(|e| AgentError::DockerError(format!("failed to ping Docker daemon: {e}")))?;
        Ok(())
    }

    /// Ensure the two internal bridge networks exist, creating any missing
    /// one labelled as managed. Called once on startup.
    pub async fn ensure_networks(&self) -> AgentResult<()> {
        let networks = self
            .cli
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|e| AgentError::DockerError(format!("failed to list networks: {e}")))?;

        let existing: Vec<String> = networks.into_iter().filter_map(|n| n.name).collect();

        for name in [BACKEND_NETWORK, SERVERS_NETWORK] {
            if existing.iter().any(|n| n == name) {
                debug!("Docker network '{}' already exists", name);
                continue;
            }
            info!("Creating Docker network: {}", name);
            self.cli
                .create_network(CreateNetworkOptions {
                    name: name.to_string(),
                    driver: "bridge".to_string(),
                    labels: HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
                    ..Default::default()
                })
                .await
                .map_err(|e| AgentError::DockerError(format!("failed to create network {name}: {e}")))?;
        }

        Ok(())
    }

    /// List all managed containers (running and stopped). Only containers
    /// carrying `zedops.managed=true` are ever returned.
    pub async fn list_containers(&self) -> AgentResult<Vec<ContainerInfo>> {
        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{MANAGED_LABEL}=true")],
            )]),
            ..Default::default()
        };

        let containers = self
            .cli
            .list_containers(Some(options))
            .await
            .map_err(|e| AgentError::DockerError(format!("failed to list containers: {e}")))?;

        let mut result = Vec::with_capacity(containers.len());
        for c in containers {
            let id = c.id.unwrap_or_default();
            let state = c.state.unwrap_or_default();
            let labels = c.labels.unwrap_or_default();

            // The list API doesn't carry health; running containers get it
            // from a follow-up inspect.
            let health = if state == "running" {
                self.inspect(&id)
                    .await
                    .ok()
                    .and_then(|inspect| inspect.state)
                    .and_then(|s| s.health)
                    .and_then(|h| h.status)
                    .and_then(health_status_str)
            } else {
                None
            };

            result.push(ContainerInfo {
                image_version: labels.get(IMAGE_VERSION_LABEL).cloned(),
                names: c.names.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
                created: c.created.unwrap_or_default(),
                ports: c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| PortMapping {
                        private_port: p.private_port,
                        public_port: p.public_port.unwrap_or_default(),
                        protocol: p.typ.map(|t| t.to_string()).unwrap_or_default(),
                    })
                    .collect(),
                id,
                state,
                health,
                labels,
            });
        }

        Ok(result)
    }

    pub async fn inspect(&self, container_id: &str) -> AgentResult<ContainerInspectResponse> {
        self.cli
            .inspect_container(container_id, None)
            .await
            .map_err(|e| AgentError::DockerError(format!("failed to inspect container {container_id}: {e}")))
    }

    pub async fn start_container(&self, container_id: &str) -> AgentResult<()> {
        info!("Starting container: {}", container_id);
        self.cli
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| AgentError::DockerError(format!("failed to start container {container_id}: {e}")))?;
        Ok(())
    }

    /// Stop a container with a graceful in-game save first.
    pub async fn stop_container(&self, container_id: &str) -> AgentResult<()> {
        info!("Stopping container: {}", container_id);
        self.graceful_save(container_id).await;
        self.cli
            .stop_container(
                container_id,
                Some(StopContainerOptions { t: GRACEFUL_STOP_TIMEOUT }),
            )
            .await
            .map_err(|e| AgentError::DockerError(format!("failed to stop container {container_id}: {e}")))?;
        Ok(())
    }

    /// Stop without the pre-save; used where the caller already saved.
    pub async fn stop_container_raw(&self, container_id: &str) -> AgentResult<()> {
        self.cli
            .stop_container(
                container_id,
                Some(StopContainerOptions { t: GRACEFUL_STOP_TIMEOUT }),
            )
            .await
            .map_err(|e| AgentError::DockerError(format!("failed to stop container {container_id}: {e}")))?;
        Ok(())
    }

    pub async fn restart_container(&self, container_id: &str) -> AgentResult<()> {
        info!("Restarting container: {}", container_id);
        self.graceful_save(container_id).await;
        self.cli
            .restart_container(
                container_id,
                Some(RestartContainerOptions { t: GRACEFUL_STOP_TIMEOUT as isize }),
            )
            .await
            .map_err(|e| AgentError::DockerError(format!("failed to restart container {container_id}: {e}")))?;
        Ok(())
    }

    pub async fn remove_container(&self, container_id: &str) -> AgentResult<()> {
        self.cli
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    // The agent owns the bind-mount tree; the daemon must
                    // never manage it as volumes.
                    v: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| AgentError::DockerError(format!("failed to remove container {container_id}: {e}")))?;
        Ok(())
    }

    /// Pull an image, always consulting the registry. Logs whether layers
    /// were freshly downloaded or served from the local cache.
    pub async fn pull_image(&self, reference: &str) -> AgentResult<()> {
        info!("Pulling image: {} (checking registry for updates...)", reference);

        let (image, tag) = reference.split_once(':').unwrap_or((reference, "latest"));
        let mut stream = self.cli.create_image(
            Some(CreateImageOptions {
                from_image: image,
                tag,
                ..Default::default()
            }),
            None,
            None,
        );

        let mut downloaded = false;
        let mut cached = false;
        while let Some(status) = stream.next().await {
            let status = status.map_err(|e| AgentError::DockerError(format!("failed to pull image: {e}")))?;
            match status.status.as_deref() {
                Some("Already exists") => cached = true,
                Some("Pull complete") | Some("Download complete") => downloaded = true,
                _ => {}
            }
        }

        if downloaded {
            info!("Image updated from registry: {}", reference);
        } else if cached {
            info!("Image up to date (using cached): {}", reference);
        } else {
            info!("Image pulled: {}", reference);
        }
        Ok(())
    }

    /// Follow a container's log stream. The daemon demultiplexes stdout and
    /// stderr frames; `timestamps: true` prefixes each line with an
    /// RFC3339Nano timestamp which [`log_output_line`] strips off.
    pub fn follow_logs(
        &self,
        container_id: &str,
        tail: i64,
    ) -> BoxStream<'_, Result<LogOutput, bollard::errors::Error>> {
        self.cli
            .logs(
                container_id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    timestamps: true,
                    tail: tail.to_string(),
                    ..Default::default()
                }),
            )
            .boxed()
    }

    /// One-shot resource snapshot for a container.
    pub async fn collect_container_metrics(&self, container_id: &str) -> AgentResult<ContainerMetrics> {
        let mut stream = self.cli.stats(
            container_id,
            Some(StatsOptions { stream: false, one_shot: false }),
        );
        let stats: Stats = stream
            .next()
            .await
            .ok_or_else(|| AgentError::DockerError("no stats returned".into()))?
            .map_err(|e| AgentError::DockerError(format!("failed to get container stats: {e}")))?;

        let cpu_percent = cpu_percent(
            stats.cpu_stats.cpu_usage.total_usage,
            stats.precpu_stats.cpu_usage.total_usage,
            stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            stats.cpu_stats.online_cpus.unwrap_or(0),
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|v| v.len() as u64)
                .unwrap_or(0),
        );

        let memory_used_mb = (stats.memory_stats.usage.unwrap_or(0) / 1024 / 1024) as i64;
        let memory_limit_mb = (stats.memory_stats.limit.unwrap_or(0) / 1024 / 1024) as i64;

        let mut disk_read_mb = 0i64;
        let mut disk_write_mb = 0i64;
        if let Some(entries) = &stats.blkio_stats.io_service_bytes_recursive {
            for entry in entries {
                match entry.op.as_str() {
                    "read" | "Read" => disk_read_mb += (entry.value / 1024 / 1024) as i64,
                    "write" | "Write" => disk_write_mb += (entry.value / 1024 / 1024) as i64,
                    _ => {}
                }
            }
        }

        let (uptime, uptime_seconds) = match self.container_uptime(container_id).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Failed to get container uptime: {}", e);
                ("N/A".to_string(), 0)
            }
        };

        Ok(ContainerMetrics {
            container_id: container_id.to_string(),
            cpu_percent,
            memory_used_mb,
            memory_limit_mb,
            disk_read_mb,
            disk_write_mb,
            uptime,
            uptime_seconds,
        })
    }

    /// Human-readable uptime and raw seconds for a running container.
    pub async fn container_uptime(&self, container_id: &str) -> AgentResult<(String, i64)> {
        let inspect = self.inspect(container_id).await?;
        let state = inspect.state.unwrap_or_default();
        if !state.running.unwrap_or(false) {
            return Ok(("Not running".to_string(), 0));
        }

        let started_at = state
            .started_at
            .ok_or_else(|| AgentError::DockerError("container has no StartedAt".into()))?;
        let started = chrono::DateTime::parse_from_rfc3339(&started_at)
            .map_err(|e| AgentError::DockerError(format!("failed to parse StartedAt: {e}")))?;
        let seconds = (chrono::Utc::now() - started.with_timezone(&chrono::Utc)).num_seconds().max(0);
        Ok((format_uptime(seconds), seconds))
    }

    /// Default ENV of an image as a key-value map. When the exact reference
    /// is not found locally, fall back to matching local images by `:TAG`
    /// suffix.
    pub async fn get_image_defaults(&self, image_tag: &str) -> AgentResult<HashMap<String, String>> {
        let inspect = match self.cli.inspect_image(image_tag).await {
            Ok(inspect) => inspect,
            Err(original) => {
                debug!(
                    "Direct inspection of '{}' failed, searching for images with matching tag...",
                    image_tag
                );
                let images = self
                    .cli
                    .list_images(None::<ListImagesOptions<String>>)
                    .await
                    .map_err(|e| AgentError::DockerError(format!("failed to list images: {e}")))?;

                let suffix = format!(":{image_tag}");
                let matched = images
                    .into_iter()
                    .flat_map(|img| img.repo_tags)
                    .find(|tag| tag.ends_with(&suffix) || tag.as_str() == image_tag);

                let Some(matched) = matched else {
                    return Err(AgentError::NotFound(format!(
                        "no image found matching tag '{image_tag}': {original}"
                    )));
                };
                debug!("Found matching image: {}", matched);
                self.cli
                    .inspect_image(&matched)
                    .await
                    .map_err(|e| AgentError::DockerError(format!("failed to inspect matched image {matched}: {e}")))?
            }
        };

        let env = inspect.config.and_then(|c| c.env).unwrap_or_default();
        let defaults = parse_env_list(&env);
        debug!("Extracted {} ENV defaults from image {}", defaults.len(), image_tag);
        Ok(defaults)
    }

    /// Container IP on the backend bridge network.
    pub async fn backend_ip(&self, container_id: &str) -> AgentResult<String> {
        let inspect = self.inspect(container_id).await?;
        backend_ip_of(&inspect).ok_or_else(|| {
            AgentError::DockerError(format!(
                "container {} has no address on the {} network",
                rcon::short_id(container_id),
                BACKEND_NETWORK
            ))
        })
    }

    /// Inspect a container for RCON ENV, connect over the backend network,
    /// send `save`, and wait a fixed flush window. Every failure is
    /// non-fatal; the boolean only feeds the caller's metadata.
    pub async fn graceful_save(&self, container_id: &str) -> bool {
        if container_id.is_empty() {
            return false;
        }

        let inspect = match self.inspect(container_id).await {
            Ok(inspect) => inspect,
            Err(e) => {
                warn!("[GracefulSave] Failed to inspect container {}: {}", container_id, e);
                return false;
            }
        };

        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            debug!("[GracefulSave] Container {} is not running, skipping save", container_id);
            return false;
        }

        let env = parse_env_list(
            &inspect
                .config
                .as_ref()
                .and_then(|c| c.env.clone())
                .unwrap_or_default(),
        );
        let (Some(port), Some(password)) = (env.get("RCON_PORT"), env.get("RCON_PASSWORD")) else {
            debug!(
                "[GracefulSave] Container {} missing RCON_PORT or RCON_PASSWORD ENV, skipping save",
                container_id
            );
            return false;
        };

        let Some(ip) = backend_ip_of(&inspect) else {
            debug!(
                "[GracefulSave] Container {} not on {} network, skipping save",
                container_id, BACKEND_NETWORK
            );
            return false;
        };

        let addr = format!("{ip}:{port}");
        info!("[GracefulSave] Connecting to RCON at {} for pre-stop save", addr);

        let mut conn = match RconConnection::connect(&addr, password, rcon::SAVE_DIAL_TIMEOUT).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("[GracefulSave] RCON connection failed: {}", e);
                return false;
            }
        };

        if let Err(e) = conn.execute("save").await {
            warn!("[GracefulSave] RCON save command failed: {}", e);
            return false;
        }

        info!("[GracefulSave] Save command sent, waiting 3s for disk flush");
        tokio::time::sleep(SAVE_FLUSH_WAIT).await;
        true
    }
}

/// Parse a `KEY=VALUE` env list into a map.
pub fn parse_env_list(env: &[String]) -> HashMap<String, String> {
    env.iter()
        .filter_map(|entry| entry.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}

pub fn backend_ip_of(inspect: &ContainerInspectResponse) -> Option<String> {
    inspect
        .network_settings
        .as_ref()?
        .networks
        .as_ref()?
        .get(BACKEND_NETWORK)?
        .ip_address
        .clone()
        .filter(|ip| !ip.is_empty())
}

fn health_status_str(status: HealthStatusEnum) -> Option<String> {
    match status {
        HealthStatusEnum::STARTING => Some("starting".to_string()),
        HealthStatusEnum::HEALTHY => Some("healthy".to_string()),
        HealthStatusEnum::UNHEALTHY => Some("unhealthy".to_string()),
        _ => None,
    }
}

/// Convert a demultiplexed log frame into a [`LogLine`], parsing the
/// leading RFC3339Nano timestamp when present (else "now").
pub fn log_output_line(container_id: &str, output: LogOutput) -> LogLine {
    let (stream, message) = match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            ("stdout", String::from_utf8_lossy(&message).to_string())
        }
        LogOutput::StdErr { message } => ("stderr", String::from_utf8_lossy(&message).to_string()),
        LogOutput::StdIn { message } => ("unknown", String::from_utf8_lossy(&message).to_string()),
    };

    let line = message.trim_end_matches('\n');
    let (timestamp, message) = parse_log_line(line);

    LogLine {
        container_id: container_id.to_string(),
        timestamp,
        stream: stream.to_string(),
        message,
    }
}

/// Split "2024-01-10T12:34:56.789123456Z message" into (millis, message).
fn parse_log_line(line: &str) -> (i64, String) {
    let space = line.char_indices().take(40).find(|(_, c)| *c == ' ').map(|(i, _)| i);
    let Some(space) = space else {
        return (chrono::Utc::now().timestamp_millis(), line.to_string());
    };

    match chrono::DateTime::parse_from_rfc3339(&line[..space]) {
        Ok(ts) => (ts.timestamp_millis(), line[space + 1..].to_string()),
        Err(_) => (chrono::Utc::now().timestamp_millis(), line.to_string()),
    }
}

/// CPU usage percentage from the daemon's pre/post totals.
pub fn cpu_percent(
    cpu_total: u64,
    precpu_total: u64,
    system: u64,
    presystem: u64,
    online_cpus: u64,
    percpu_len: u64,
) -> f64 {
    let cpu_delta = cpu_total.saturating_sub(precpu_total) as f64;
    let system_delta = system.saturating_sub(presystem) as f64;

    let mut online = online_cpus as f64;
    if online == 0.0 {
        online = percpu_len as f64;
        if online == 0.0 {
            online = 1.0;
        }
    }

    if system_delta > 0.0 && cpu_delta > 0.0 {
        (cpu_delta / system_delta) * online * 100.0
    } else {
        0.0
    }
}

/// Format seconds as "5m", "2h 34m", "3d 12h".
pub fn format_uptime(seconds: i64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3600;
    let minutes = (seconds % 3600) / 60;

    if days > 0 {
        if hours > 0 {
            return format!("{days}d {hours}h");
        }
        return format!("{days}d");
    }
    if hours > 0 {
        if minutes > 0 {
            return format!("{hours}h {minutes}m");
        }
        return format!("{hours}h");
    }
    format!("{minutes}m")
}

/// List remote tags for a registry reference using the Registry HTTP API,
/// omitting buildcache manifests. "latest" sorts first, then
/// reverse-lexicographic (good enough for semver-like tags).
pub async fn list_registry_tags(registry: &str) -> AgentResult<Vec<String>> {
    if registry.is_empty() {
        return Err(AgentError::InvalidRequest("registry is required".into()));
    }

    let (host, repo) = registry
        .split_once('/')
        .ok_or_else(|| AgentError::InvalidRequest(format!("invalid registry reference: {registry}")))?;
    let url = format!("https://{host}/v2/{repo}/tags/list");
    debug!("Fetching tags from registry: {}", url);

    #[derive(Deserialize)]
    struct TagsList {
        #[serde(default)]
        tags: Vec<String>,
    }

    let client = reqwest::Client::builder().timeout(Duration::from_secs(15)).build()?;
    let resp = client.get(&url).send().await?;
    if !resp.status().is_success() {
        return Err(AgentError::NetworkError(format!(
            "registry returned status {} for {url}",
            resp.status()
        )));
    }
    let list: TagsList = resp.json().await?;
    Ok(sort_registry_tags(list.tags))
}

pub fn sort_registry_tags(raw: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = raw
        .into_iter()
        .filter(|tag| tag != "buildcache" && !tag.starts_with("buildcache-"))
        .collect();

    tags.sort_by(|a, b| {
        if a == "latest" {
            std::cmp::Ordering::Less
        } else if b == "latest" {
            std::cmp::Ordering::Greater
        } else {
            b.cmp(a)
        }
    });
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_percent_uses_online_cpus() {
        let pct = cpu_percent(200, 100, 1000, 800, 4, 0);
        assert!((pct - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cpu_percent_falls_back_to_percpu_len() {
        let pct = cpu_percent(150, 100, 1100, 1000, 0, 2);
        assert!((pct - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cpu_percent_zero_without_delta() {
        assert_eq!(cpu_percent(100, 100, 1000, 1000, 4, 4), 0.0);
        assert_eq!(cpu_percent(100, 200, 1000, 900, 4, 4), 0.0);
    }

    #[test]
    fn parse_log_line_with_timestamp() {
        let (ts, message) = parse_log_line("2024-01-10T12:34:56.789123456Z server started");
        assert_eq!(message, "server started");
        // 2024-01-10T12:34:56.789Z in millis
        assert_eq!(ts, 1704890096789);
    }

    #[test]
    fn parse_log_line_without_timestamp_keeps_line() {
        let before = chrono::Utc::now().timestamp_millis();
        let (ts, message) = parse_log_line("no-timestamp-here");
        assert_eq!(message, "no-timestamp-here");
        assert!(ts >= before);

        let (_, message) = parse_log_line("garbage stamp then text");
        assert_eq!(message, "garbage stamp then text");
    }

    #[test]
    fn format_uptime_ranges() {
        assert_eq!(format_uptime(42), "42s");
        assert_eq!(format_uptime(5 * 60), "5m");
        assert_eq!(format_uptime(2 * 3600 + 34 * 60), "2h 34m");
        assert_eq!(format_uptime(3 * 86_400 + 12 * 3600), "3d 12h");
        assert_eq!(format_uptime(86_400), "1d");
    }

    #[test]
    fn registry_tag_sort_puts_latest_first() {
        let tags = sort_registry_tags(vec![
            "1.0.9".into(),
            "buildcache".into(),
            "latest".into(),
            "1.0.10".into(),
            "buildcache-arm64".into(),
            "1.0.11".into(),
        ]);
        assert_eq!(tags[0], "latest");
        assert!(!tags.iter().any(|t| t.starts_with("buildcache")));
        // Reverse-lexicographic for the rest.
        assert_eq!(tags[1], "1.0.9");
        assert_eq!(tags[2], "1.0.11");
        assert_eq!(tags[3], "1.0.10");
    }

    #[test]
    fn env_list_parses_pairs() {
        let env = vec![
            "RCON_PORT=27015".to_string(),
            "RCON_PASSWORD=p=with=equals".to_string(),
            "BROKEN".to_string(),
        ];
        let map = parse_env_list(&env);
        assert_eq!(map.get("RCON_PORT").map(String::as_str), Some("27015"));
        assert_eq!(map.get("RCON_PASSWORD").map(String::as_str), Some("p=with=equals"));
        assert!(!map.contains_key("BROKEN"));
    }
}
