use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::docker::{DockerClient, SERVER_ID_LABEL};
use crate::message::Message;
use crate::playerstats::SharedPlayerStats;
use crate::rcon;
use crate::Agent;

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const STARTUP_DELAY: Duration = Duration::from_secs(5);
const BATCH_TIMEOUT: Duration = Duration::from_secs(8);

/// One metrics sample for one server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetricsPoint {
    pub server_id: String,
    pub timestamp: i64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    #[serde(rename = "memoryUsedMB")]
    pub memory_used_mb: i64,
    #[serde(rename = "memoryLimitMB")]
    pub memory_limit_mb: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsBatch {
    pub agent_id: String,
    pub points: Vec<ServerMetricsPoint>,
}

/// Periodic per-container stats batching, joined with the latest player
/// counts. Entirely suppressed while the session is unauthenticated.
pub fn spawn(agent: Agent, docker: Arc<DockerClient>, player_stats: SharedPlayerStats) -> JoinHandle<()> {
    info!("[MetricsCollector] Starting metrics collector (10s interval)");
    tokio::spawn(async move {
        tokio::time::sleep(STARTUP_DELAY).await;
        collect_and_send(&agent, &docker, &player_stats).await;

        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            collect_and_send(&agent, &docker, &player_stats).await;
        }
    })
}

async fn collect_and_send(agent: &Agent, docker: &DockerClient, player_stats: &SharedPlayerStats) {
    if !agent.is_authenticated() {
        return;
    }

    let result = tokio::time::timeout(BATCH_TIMEOUT, collect_batch(agent, docker, player_stats)).await;
    let points = match result {
        Ok(points) => points,
        Err(_) => {
            warn!("[MetricsCollector] Collection timed out");
            return;
        }
    };

    if points.is_empty() {
        return;
    }

    let batch = MetricsBatch {
        agent_id: agent.agent_id().await,
        points,
    };
    let count = batch.points.len();
    if let Err(e) = agent.send_message(Message::new("server.metrics.batch", batch)).await {
        warn!("[MetricsCollector] Failed to send metrics batch: {}", e);
    } else {
        debug!("[MetricsCollector] Sent batch: {} servers", count);
    }
}

async fn collect_batch(
    _agent: &Agent,
    docker: &DockerClient,
    player_stats: &SharedPlayerStats,
) -> Vec<ServerMetricsPoint> {
    let containers = match docker.list_containers().await {
        Ok(containers) => containers,
        Err(e) => {
            warn!("[MetricsCollector] Failed to list containers: {}", e);
            return Vec::new();
        }
    };

    let running: Vec<_> = containers.into_iter().filter(|c| c.state == "running").collect();
    if running.is_empty() {
        debug!("[MetricsCollector] No running managed containers found");
        return Vec::new();
    }

    let stats_by_server = player_stats.read().await.clone();
    let now = chrono::Utc::now().timestamp();

    let mut points = Vec::with_capacity(running.len());
    for container in running {
        let Some(server_id) = container.labels.get(SERVER_ID_LABEL).cloned() else {
            continue;
        };

        let metrics = match docker.collect_container_metrics(&container.id).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(
                    "[MetricsCollector] Failed to collect metrics for {}: {}",
                    rcon::short_id(&container.id),
                    e
                );
                continue;
            }
        };

        let memory_percent = if metrics.memory_limit_mb > 0 {
            metrics.memory_used_mb as f64 / metrics.memory_limit_mb as f64 * 100.0
        } else {
            0.0
        };

        points.push(ServerMetricsPoint {
            player_count: stats_by_server.get(&server_id).map(|s| s.player_count),
            server_id,
            timestamp: now,
            cpu_percent: metrics.cpu_percent,
            memory_percent,
            memory_used_mb: metrics.memory_used_mb,
            memory_limit_mb: metrics.memory_limit_mb,
        });
    }

    points
}
