use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::docker::{self, DockerClient, SERVER_ID_LABEL, SERVER_NAME_LABEL};
use crate::message::Message;
use crate::rcon::{self, RconConnection};
use crate::Agent;

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_RCON_PORT: u16 = 27015;
pub const DEFAULT_MAX_PLAYERS: i64 = 32;

/// Player information for one server, published on `players.update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    pub server_id: String,
    pub server_name: String,
    pub player_count: i64,
    pub max_players: i64,
    pub players: Option<Vec<String>>,
    pub rcon_connected: bool,
    pub last_update: i64,
}

/// RCON coordinates for a discovered server.
#[derive(Debug, Clone)]
struct ServerRconConfig {
    server_id: String,
    server_name: String,
    container_id: String,
    rcon_port: u16,
    rcon_password: String,
    max_players: i64,
}

/// Shared view of the latest stats, read by the metrics collector.
pub type SharedPlayerStats = Arc<RwLock<HashMap<String, PlayerStats>>>;

/// Periodic RCON poll across all running managed containers. Connections
/// are pooled per server and evicted on any failure.
pub fn spawn(agent: Agent, docker: Arc<DockerClient>, stats: SharedPlayerStats) -> JoinHandle<()> {
    info!("[PlayerStats] Starting player stats collector (10s interval)");
    tokio::spawn(async move {
        let mut connections: HashMap<String, RconConnection> = HashMap::new();
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            interval.tick().await;
            collect_all(&agent, &docker, &stats, &mut connections).await;
        }
    })
}

async fn collect_all(
    agent: &Agent,
    docker: &DockerClient,
    stats: &SharedPlayerStats,
    connections: &mut HashMap<String, RconConnection>,
) {
    // Stay quiet while the session is down.
    if !agent.is_authenticated() {
        return;
    }

    let configs = match discover_servers(docker).await {
        Ok(configs) => configs,
        Err(e) => {
            warn!("[PlayerStats] Failed to discover servers: {}", e);
            return;
        }
    };

    if configs.is_empty() {
        connections.clear();
        stats.write().await.clear();
        return;
    }

    let mut all_stats: HashMap<String, PlayerStats> = HashMap::new();
    for config in &configs {
        let server_stats = collect_server_stats(docker, config, connections).await;
        all_stats.insert(config.server_id.clone(), server_stats);
    }

    // Drop connections for servers that disappeared.
    let live: Vec<String> = configs.iter().map(|c| c.server_id.clone()).collect();
    connections.retain(|server_id, _| {
        let keep = live.contains(server_id);
        if !keep {
            info!("[PlayerStats] Closed connection for stopped server {}", server_id);
        }
        keep
    });

    {
        let mut shared = stats.write().await;
        shared.retain(|server_id, _| live.contains(server_id));
        for (server_id, server_stats) in &all_stats {
            shared.insert(server_id.clone(), server_stats.clone());
        }
    }

    let servers: Vec<&PlayerStats> = all_stats.values().collect();
    let total: i64 = servers.iter().map(|s| s.player_count).sum();
    let msg = Message::new("players.update", json!({ "servers": servers }));
    if let Err(e) = agent.send_message(msg).await {
        warn!("[PlayerStats] Failed to send stats update: {}", e);
    } else {
        info!(
            "[PlayerStats] Sent update: {} servers, {} total players",
            all_stats.len(),
            total
        );
    }
}

/// Find running managed containers and pull their RCON coordinates from
/// labels and container ENV.
async fn discover_servers(docker: &DockerClient) -> crate::errors::AgentResult<Vec<ServerRconConfig>> {
    let containers = docker.list_containers().await?;

    let mut configs = Vec::new();
    for container in containers {
        if container.state != "running" {
            continue;
        }
        let Some(server_id) = container.labels.get(SERVER_ID_LABEL).cloned() else {
            continue;
        };
        let server_name = container.labels.get(SERVER_NAME_LABEL).cloned().unwrap_or_default();

        let Ok(inspect) = docker.inspect(&container.id).await else {
            warn!("[PlayerStats] Failed to inspect container {}", rcon::short_id(&container.id));
            continue;
        };
        let env = docker::parse_env_list(
            &inspect.config.and_then(|c| c.env).unwrap_or_default(),
        );

        let rcon_password = env
            .get("RCON_PASSWORD")
            .or_else(|| env.get("ADMIN_PASSWORD"))
            .cloned()
            .unwrap_or_default();
        if rcon_password.is_empty() {
            // RCON not configured for this server.
            continue;
        }

        let rcon_port = env
            .get("RCON_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_RCON_PORT);
        let max_players = env
            .get("MAX_PLAYERS")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_MAX_PLAYERS);

        configs.push(ServerRconConfig {
            server_id,
            server_name,
            container_id: container.id,
            rcon_port,
            rcon_password,
            max_players,
        });
    }

    Ok(configs)
}

async fn collect_server_stats(
    docker: &DockerClient,
    config: &ServerRconConfig,
    connections: &mut HashMap<String, RconConnection>,
) -> PlayerStats {
    let disconnected = || PlayerStats {
        server_id: config.server_id.clone(),
        server_name: config.server_name.clone(),
        player_count: 0,
        max_players: config.max_players,
        players: None,
        rcon_connected: false,
        last_update: chrono::Utc::now().timestamp(),
    };

    if !connections.contains_key(&config.server_id) {
        let ip = match docker.backend_ip(&config.container_id).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("[PlayerStats] {}", e);
                return disconnected();
            }
        };
        let addr = format!("{ip}:{}", config.rcon_port);
        info!("[PlayerStats] Connecting to {} RCON at {}", config.server_name, addr);
        match RconConnection::connect(&addr, &config.rcon_password, CONNECT_TIMEOUT).await {
            Ok(conn) => {
                connections.insert(config.server_id.clone(), conn);
                info!("[PlayerStats] Connected to {} RCON", config.server_name);
            }
            Err(e) => {
                warn!("[PlayerStats] RCON connection failed for {}: {}", config.server_name, e);
                return disconnected();
            }
        }
    }

    let Some(conn) = connections.get_mut(&config.server_id) else {
        return disconnected();
    };
    let response = match conn.execute("players").await {
        Ok(response) => response,
        Err(e) => {
            warn!("[PlayerStats] RCON command failed for {}: {}", config.server_name, e);
            // Broken connection; evict so the next poll reconnects.
            connections.remove(&config.server_id);
            return disconnected();
        }
    };

    let (count, players) = parse_players_response(&response);
    PlayerStats {
        server_id: config.server_id.clone(),
        server_name: config.server_name.clone(),
        player_count: count,
        max_players: config.max_players,
        players,
        rcon_connected: true,
        last_update: chrono::Utc::now().timestamp(),
    }
}

/// Parse the free-form `players` response. Accepted shapes, in order:
/// `Players connected (N): a, b, c`, then `Players connected: N`, then a
/// plain list of names, one per line.
pub fn parse_players_response(response: &str) -> (i64, Option<Vec<String>>) {
    let response = response.trim();
    if response.is_empty() {
        return (0, None);
    }

    let with_names = Regex::new(r"Players connected\s*\((\d+)\)\s*:?\s*(.*)").unwrap();
    if let Some(caps) = with_names.captures(response) {
        let count = caps[1].parse().unwrap_or(0);
        let names: Vec<String> = caps
            .get(2)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        return (count, (!names.is_empty()).then_some(names));
    }

    let count_only = Regex::new(r"Players connected:\s*(\d+)").unwrap();
    if let Some(caps) = count_only.captures(response) {
        return (caps[1].parse().unwrap_or(0), None);
    }

    let names: Vec<String> = response
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.to_lowercase().starts_with("players"))
        .map(str::to_string)
        .collect();
    (names.len() as i64, (!names.is_empty()).then_some(names))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_count_with_names() {
        let (count, players) = parse_players_response("Players connected (3): alice, bob, carol");
        assert_eq!(count, 3);
        assert_eq!(players.unwrap(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn parses_count_without_names() {
        let (count, players) = parse_players_response("Players connected: 0");
        assert_eq!(count, 0);
        assert!(players.is_none());

        let (count, players) = parse_players_response("Players connected (2):");
        assert_eq!(count, 2);
        assert!(players.is_none());
    }

    #[test]
    fn falls_back_to_line_counting() {
        let (count, players) = parse_players_response("Players on server:\nalice\nbob\n");
        assert_eq!(count, 2);
        assert_eq!(players.unwrap(), vec!["alice", "bob"]);
    }

    #[test]
    fn empty_response_is_zero() {
        assert_eq!(parse_players_response(""), (0, None));
        assert_eq!(parse_players_response("   \n  "), (0, None));
    }
}
