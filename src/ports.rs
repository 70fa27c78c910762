use std::collections::{HashMap, HashSet};

use bollard::container::ListContainersOptions;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::docker::DockerClient;
use crate::errors::AgentResult;

#[derive(Debug, Clone, Deserialize)]
pub struct PortCheckRequest {
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortConflict {
    pub port: u16,
    pub reason: String,
    /// "docker" or "host"
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortAvailability {
    pub available: Vec<u16>,
    pub unavailable: Vec<PortConflict>,
}

impl DockerClient {
    /// Report which requested ports are free. A port is unavailable when a
    /// container publishes it or any host process has it bound.
    pub async fn check_port_availability(&self, ports: &[u16]) -> AgentResult<PortAvailability> {
        // All containers count here, managed or not, including stopped ones.
        let mut docker_ports: HashMap<u16, String> = HashMap::new();
        match self
            .cli
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
        {
            Ok(containers) => {
                for c in containers {
                    let name = c
                        .names
                        .as_ref()
                        .and_then(|names| names.first())
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    for port in c.ports.unwrap_or_default() {
                        if let Some(public) = port.public_port {
                            if public > 0 {
                                docker_ports.insert(public, name.clone());
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("Failed to list containers for port check: {}", e),
        }

        let host_ports = host_bound_ports();

        let mut availability = PortAvailability {
            available: Vec::new(),
            unavailable: Vec::new(),
        };
        for &port in ports {
            if let Some(container) = docker_ports.get(&port) {
                availability.unavailable.push(PortConflict {
                    port,
                    reason: format!("Used by container '{container}'"),
                    source: "docker".to_string(),
                });
            } else if host_ports.contains(&port) {
                availability.unavailable.push(PortConflict {
                    port,
                    reason: "Port is bound at host level".to_string(),
                    source: "host".to_string(),
                });
            } else {
                availability.available.push(port);
            }
        }

        Ok(availability)
    }

    /// Scan upward from `base` in steps of 2 until a `count`-wide window is
    /// fully available. Gives up after 100 attempts.
    pub async fn suggest_next_available_ports(&self, base: u16, count: usize) -> AgentResult<Vec<u16>> {
        const MAX_ATTEMPTS: u16 = 100;

        let mut current = base;
        for _ in 0..MAX_ATTEMPTS {
            let candidate: Vec<u16> = (0..count as u16).map(|i| current + i * 2).collect();
            let availability = self.check_port_availability(&candidate).await?;
            if availability.unavailable.is_empty() {
                return Ok(candidate);
            }
            current += 2;
        }

        Err(crate::errors::AgentError::NotFound(format!(
            "no available ports found in range {}-{}",
            base,
            base + MAX_ATTEMPTS * 2
        )))
    }
}

/// All locally bound ports, parsed from the kernel's per-protocol socket
/// tables.
pub fn host_bound_ports() -> HashSet<u16> {
    let mut ports = HashSet::new();
    for file in ["/proc/net/tcp", "/proc/net/tcp6", "/proc/net/udp", "/proc/net/udp6"] {
        match std::fs::read_to_string(file) {
            Ok(content) => ports.extend(parse_proc_net(&content)),
            Err(e) => warn!("Failed to read {}: {}", file, e),
        }
    }
    debug!("Found {} bound ports at host level", ports.len());
    ports
}

/// Parse one /proc/net/{tcp,udp} table. The local address column is
/// `IIIIIIII:PPPP` with the port in hex.
fn parse_proc_net(content: &str) -> HashSet<u16> {
    let mut ports = HashSet::new();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        let Some((_, port_hex)) = fields[1].rsplit_once(':') else {
            continue;
        };
        if let Ok(port) = u32::from_str_radix(port_hex, 16) {
            if port > 0 && port < 65536 {
                ports.insert(port as u16);
            }
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_NET_TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:3F85 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12346 1 0000000000000000 100 0 0 10 0";

    #[test]
    fn parses_hex_ports() {
        let ports = parse_proc_net(PROC_NET_TCP);
        // 0x3F85 = 16261, 0x0016 = 22
        assert!(ports.contains(&16261));
        assert!(ports.contains(&22));
        assert_eq!(ports.len(), 2);
    }

    #[test]
    fn parses_ipv6_local_address() {
        let content = "\
  sl  local_address rem_address st
   0: 00000000000000000000000000000000:1E61 00000000000000000000000000000000:0000 0A";
        let ports = parse_proc_net(content);
        assert!(ports.contains(&0x1E61));
    }

    #[test]
    fn skips_malformed_lines() {
        let content = "header\nnot-a-table-line\n   9: garbage\n   1: 0100007F:ZZZZ 0:0 0A";
        assert!(parse_proc_net(content).is_empty());
    }
}
