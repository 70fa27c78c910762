use std::collections::HashSet;
use std::path::Path;

use bollard::models::MountPointTypeEnum;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::warn;

use crate::docker::DockerClient;
use crate::errors::{AgentError, AgentResult};

/// Disk usage for a single mounted filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskMetric {
    pub path: String,
    #[serde(rename = "mountPoint")]
    pub mount_point: String,
    pub label: String,
    #[serde(rename = "usedGB")]
    pub used_gb: i64,
    #[serde(rename = "totalGB")]
    pub total_gb: i64,
    pub percent: f64,
}

/// Host snapshot piggy-backed on heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMetrics {
    pub cpu_percent: f64,
    #[serde(rename = "memoryUsedMB")]
    pub memory_used_mb: i64,
    #[serde(rename = "memoryTotalMB")]
    pub memory_total_mb: i64,
    pub disks: Vec<DiskMetric>,
    pub timestamp: i64,
}

/// Collects host CPU/memory/disk metrics.
///
/// CPU usage is a delta between consecutive refreshes, so the collector
/// retains its `System` between calls. Only the heartbeat task calls
/// `collect`; that single-writer contract is what makes the retained
/// sample safe.
pub struct HostMetricsCollector {
    system: System,
}

impl HostMetricsCollector {
    pub fn new() -> Self {
        Self { system: System::new() }
    }

    pub async fn collect(&mut self, docker: Option<&DockerClient>) -> AgentResult<HostMetrics> {
        self.system.refresh_cpu_usage();
        let cpu_percent = self.system.global_cpu_info().cpu_usage() as f64;

        self.system.refresh_memory();
        let total = self.system.total_memory();
        let available = self.system.available_memory();
        let memory_total_mb = (total / 1024 / 1024) as i64;
        let memory_used_mb = (total.saturating_sub(available) / 1024 / 1024) as i64;

        let disks = collect_disk_metrics(docker).await?;

        Ok(HostMetrics {
            cpu_percent,
            memory_used_mb,
            memory_total_mb,
            disks,
            timestamp: chrono::Utc::now().timestamp(),
        })
    }
}

impl Default for HostMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
}

/// Real (device-backed) filesystems from /proc/mounts.
fn parse_mounts() -> AgentResult<Vec<MountEntry>> {
    let content = std::fs::read_to_string("/proc/mounts")
        .map_err(|e| AgentError::IoError(format!("failed to read /proc/mounts: {e}")))?;
    Ok(parse_mounts_content(&content))
}

pub fn parse_mounts_content(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            device.starts_with("/dev/").then(|| MountEntry {
                device: device.to_string(),
                mount_point: mount_point.to_string(),
            })
        })
        .collect()
}

/// Longest-prefix match of a path onto its mount point.
pub fn find_mount_for_path<'a>(path: &str, mounts: &'a [MountEntry]) -> Option<&'a MountEntry> {
    let mut best: Option<&MountEntry> = None;
    let mut best_len = 0;
    for mount in mounts {
        let mp = &mount.mount_point;
        if path.starts_with(mp.as_str())
            && mp.len() > best_len
            && (path.len() == mp.len() || mp == "/" || path.as_bytes()[mp.len()] == b'/')
        {
            best = Some(mount);
            best_len = mp.len();
        }
    }
    best
}

fn disk_metric_for(path: &str, label: &str) -> AgentResult<DiskMetric> {
    let stat = nix::sys::statvfs::statvfs(Path::new(path))
        .map_err(|e| AgentError::IoError(format!("failed to statvfs {path}: {e}")))?;

    let frsize = stat.fragment_size() as u64;
    let total_bytes = stat.blocks() as u64 * frsize;
    let available_bytes = stat.blocks_available() as u64 * frsize;
    let used_bytes = total_bytes.saturating_sub(available_bytes);

    const GB: u64 = 1024 * 1024 * 1024;
    let total_gb = (total_bytes / GB) as i64;
    let used_gb = (used_bytes / GB) as i64;
    let percent = if total_gb > 0 {
        used_gb as f64 / total_gb as f64 * 100.0
    } else {
        0.0
    };

    Ok(DiskMetric {
        path: path.to_string(),
        mount_point: path.to_string(),
        label: label.to_string(),
        used_gb,
        total_gb,
        percent,
    })
}

fn root_only() -> AgentResult<Vec<DiskMetric>> {
    Ok(vec![disk_metric_for("/", "Root")?])
}

/// Disk metrics for the unique filesystems backing managed-container bind
/// mounts. Falls back to the root filesystem when nothing qualifies.
async fn collect_disk_metrics(docker: Option<&DockerClient>) -> AgentResult<Vec<DiskMetric>> {
    let Some(docker) = docker else {
        return root_only();
    };
    let mounts = match parse_mounts() {
        Ok(mounts) => mounts,
        Err(_) => return root_only(),
    };

    let containers = match docker.list_containers().await {
        Ok(containers) => containers,
        Err(_) => return root_only(),
    };

    let mut seen_devices: HashSet<String> = HashSet::new();
    let mut metrics = Vec::new();

    for container in containers {
        let Ok(inspect) = docker.inspect(&container.id).await else {
            continue;
        };
        for mount in inspect.mounts.unwrap_or_default() {
            if mount.typ != Some(MountPointTypeEnum::BIND) {
                continue;
            }
            let Some(source) = mount.source else {
                continue;
            };
            let Some(entry) = find_mount_for_path(&source, &mounts) else {
                continue;
            };
            if !seen_devices.insert(entry.device.clone()) {
                continue;
            }
            match disk_metric_for(&entry.mount_point, &entry.mount_point) {
                Ok(metric) => metrics.push(metric),
                Err(e) => warn!("Failed to collect disk metric for {}: {}", entry.mount_point, e),
            }
        }
    }

    if metrics.is_empty() {
        return root_only();
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
sysfs /sys sysfs rw 0 0
proc /proc proc rw 0 0
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/mapper/main--array-petty /Volumes/Petty ext4 rw 0 0
tmpfs /run tmpfs rw 0 0
/dev/sda1 /data ext4 rw 0 0";

    #[test]
    fn parse_mounts_keeps_device_filesystems() {
        let mounts = parse_mounts_content(MOUNTS);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[0].mount_point, "/");
        assert_eq!(mounts[1].device, "/dev/mapper/main--array-petty");
        assert_eq!(mounts[2].mount_point, "/data");
    }

    #[test]
    fn mount_match_prefers_longest_prefix() {
        let mounts = parse_mounts_content(MOUNTS);
        assert_eq!(
            find_mount_for_path("/data/servers/pz1/bin", &mounts).unwrap().mount_point,
            "/data"
        );
        assert_eq!(find_mount_for_path("/var/lib", &mounts).unwrap().mount_point, "/");
        assert_eq!(
            find_mount_for_path("/Volumes/Petty/x", &mounts).unwrap().mount_point,
            "/Volumes/Petty"
        );
        // "/datastore" must not match "/data".
        assert_eq!(find_mount_for_path("/datastore", &mounts).unwrap().mount_point, "/");
    }

    #[test]
    fn disk_metric_reports_capacity() {
        let metric = disk_metric_for("/", "Root").unwrap();
        assert!(metric.total_gb >= 0);
        assert!(metric.used_gb <= metric.total_gb);
        assert!((0.0..=100.0).contains(&metric.percent));
    }
}
