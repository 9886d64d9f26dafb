// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! System information collection.
//!
//! Two paths: `collect_quick` reads procfs only and is cheap enough for the
//! heartbeat loop (results are cached for a short TTL); `collect` adds
//! Docker state, software versions, and agent runtime info, with every
//! subprocess call bounded by a configurable timeout. Collection failures
//! are non-fatal and surface as an `error` string in the affected section.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// TTL for the quick-path cache.
const QUICK_CACHE_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadInfo {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInfo {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub interface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeInfo {
    pub seconds: u64,
    pub formatted: String,
}

/// procfs-only snapshot, safe for the heartbeat path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickInfo {
    pub load: LoadInfo,
    pub memory: MemoryInfo,
    pub disk: DiskInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkInfo>,
    pub uptime: UptimeInfo,
}

/// The heartbeat-enrichment subset.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickMetrics {
    pub load1: f64,
    pub mem_percent: f64,
    pub disk_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub state: String,
    pub created_at: String,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub mem_usage: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerInfo {
    pub version: String,
    pub containers: Vec<ContainerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftwareVersions {
    pub node: Option<String>,
    pub docker_server: Option<String>,
    pub devcontainer: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub version: String,
    pub runtime: String,
}

/// Full system snapshot for `GET /api/system-info`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullInfo {
    #[serde(flatten)]
    pub quick: QuickInfo,
    pub docker: DockerInfo,
    pub software: SoftwareVersions,
    pub agent: RuntimeInfo,
}

#[derive(Debug, Clone)]
pub struct SysinfoConfig {
    pub docker_timeout: Duration,
    pub docker_list_timeout: Duration,
    pub docker_stats_timeout: Duration,
    /// Filesystem whose usage is reported (the workspace volume).
    pub disk_path: std::path::PathBuf,
}

impl Default for SysinfoConfig {
    fn default() -> Self {
        Self {
            docker_timeout: Duration::from_secs(5),
            docker_list_timeout: Duration::from_secs(5),
            docker_stats_timeout: Duration::from_secs(10),
            disk_path: std::path::PathBuf::from("/"),
        }
    }
}

pub struct Sysinfo {
    config: SysinfoConfig,
    quick_cache: Mutex<Option<(Instant, QuickInfo)>>,
}

impl Sysinfo {
    pub fn new(config: SysinfoConfig) -> Arc<Self> {
        Arc::new(Self { config, quick_cache: Mutex::new(None) })
    }

    /// procfs-only collection with a short TTL cache.
    pub fn collect_quick(&self) -> anyhow::Result<QuickInfo> {
        if let Some((at, cached)) = self.quick_cache.lock().as_ref() {
            if at.elapsed() < QUICK_CACHE_TTL {
                return Ok(cached.clone());
            }
        }

        let info = self.collect_quick_uncached()?;
        *self.quick_cache.lock() = Some((Instant::now(), info.clone()));
        Ok(info)
    }

    fn collect_quick_uncached(&self) -> anyhow::Result<QuickInfo> {
        let load = parse_loadavg(&std::fs::read_to_string("/proc/loadavg")?)?;
        let memory = parse_meminfo(&std::fs::read_to_string("/proc/meminfo")?)?;
        let disk = statvfs_disk(&self.config.disk_path)?;
        let network = std::fs::read_to_string("/proc/net/dev")
            .ok()
            .and_then(|s| parse_net_dev(&s));
        let uptime = parse_uptime(&std::fs::read_to_string("/proc/uptime")?)?;
        Ok(QuickInfo { load, memory, disk, network, uptime })
    }

    /// The subset forwarded with heartbeats. Never fails; `None` when
    /// procfs is unreadable.
    pub fn quick_metrics(&self) -> Option<QuickMetrics> {
        let info = self.collect_quick().ok()?;
        Some(QuickMetrics {
            load1: info.load.load1,
            mem_percent: info.memory.used_percent,
            disk_percent: info.disk.used_percent,
        })
    }

    /// Full collection: quick fields plus Docker, software versions, and
    /// agent runtime.
    pub async fn collect(&self) -> anyhow::Result<FullInfo> {
        let quick = self.collect_quick()?;
        let docker = self.collect_docker().await;
        let software = self.collect_software(docker.version.clone()).await;
        Ok(FullInfo {
            quick,
            docker,
            software,
            agent: RuntimeInfo {
                version: env!("CARGO_PKG_VERSION").to_owned(),
                runtime: "rust-tokio".to_owned(),
            },
        })
    }

    async fn collect_docker(&self) -> DockerInfo {
        let version = match run_command(
            "docker",
            &["version", "--format", "{{.Server.Version}}"],
            self.config.docker_timeout,
        )
        .await
        {
            Ok(out) => out.trim().to_owned(),
            Err(e) => {
                return DockerInfo {
                    error: Some(format!("docker version: {e}")),
                    ..DockerInfo::default()
                };
            }
        };

        let mut containers = match run_command(
            "docker",
            &["ps", "-a", "--format", "{{json .}}"],
            self.config.docker_list_timeout,
        )
        .await
        {
            Ok(out) => out.lines().filter_map(parse_docker_ps_line).collect::<Vec<_>>(),
            Err(e) => {
                return DockerInfo {
                    version,
                    containers: vec![],
                    error: Some(format!("docker ps: {e}")),
                };
            }
        };

        // Stats only make sense for running containers; exited ones keep
        // zeroed stats.
        let running: Vec<String> = containers
            .iter()
            .filter(|c| c.state == "running")
            .map(|c| c.id.clone())
            .collect();
        if !running.is_empty() {
            let mut args = vec!["stats", "--no-stream", "--format", "{{json .}}"];
            args.extend(running.iter().map(String::as_str));
            match run_command("docker", &args, self.config.docker_stats_timeout).await {
                Ok(out) => {
                    let stats: HashMap<String, DockerStats> = out
                        .lines()
                        .filter_map(parse_docker_stats_line)
                        .map(|s| (s.id.clone(), s))
                        .collect();
                    merge_stats(&mut containers, &stats);
                }
                Err(e) => debug!(err = %e, "docker stats failed"),
            }
        }

        DockerInfo { version, containers, error: None }
    }

    async fn collect_software(&self, docker_server: String) -> SoftwareVersions {
        let timeout = self.config.docker_timeout;
        let node = run_command("node", &["--version"], timeout).await.ok();
        let devcontainer = run_command("devcontainer", &["--version"], timeout).await.ok();
        SoftwareVersions {
            node: node.map(|s| s.trim().to_owned()),
            docker_server: (!docker_server.is_empty()).then_some(docker_server),
            devcontainer: devcontainer.map(|s| s.trim().to_owned()),
        }
    }
}

/// Run a subprocess with a timeout, returning stdout.
pub async fn run_command(program: &str, args: &[&str], timeout: Duration) -> anyhow::Result<String> {
    let fut = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| anyhow::anyhow!("{program} timed out after {timeout:?}"))??;
    if !output.status.success() {
        anyhow::bail!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// -- Parsers ------------------------------------------------------------------

/// `/proc/loadavg`: first three whitespace-separated numbers.
pub fn parse_loadavg(contents: &str) -> anyhow::Result<LoadInfo> {
    let mut fields = contents.split_whitespace();
    let mut next = || -> anyhow::Result<f64> {
        fields
            .next()
            .ok_or_else(|| anyhow::anyhow!("short loadavg"))?
            .parse::<f64>()
            .map_err(Into::into)
    };
    Ok(LoadInfo { load1: next()?, load5: next()?, load15: next()? })
}

/// `/proc/meminfo`: `Key: value kB` lines, values in KiB.
pub fn parse_meminfo(contents: &str) -> anyhow::Result<MemoryInfo> {
    let mut values: HashMap<&str, u64> = HashMap::new();
    for line in contents.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
            values.insert(key.trim(), kb * 1024);
        }
    }

    let total = *values.get("MemTotal").ok_or_else(|| anyhow::anyhow!("MemTotal missing"))?;
    // Older kernels lack MemAvailable; approximate it.
    let available = values.get("MemAvailable").copied().unwrap_or_else(|| {
        values.get("MemFree").copied().unwrap_or(0)
            + values.get("Buffers").copied().unwrap_or(0)
            + values.get("Cached").copied().unwrap_or(0)
    });
    let used = total.saturating_sub(available);
    let used_percent = if total > 0 {
        round1(used as f64 / total as f64 * 100.0)
    } else {
        0.0
    };
    Ok(MemoryInfo { total, used, available, used_percent })
}

fn statvfs_disk(path: &std::path::Path) -> anyhow::Result<DiskInfo> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    let bsize = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * bsize;
    let available = stat.blocks_available() as u64 * bsize;
    let used = (stat.blocks() as u64 - stat.blocks_free() as u64) * bsize;
    let used_percent = if total > 0 {
        round1(used as f64 / total as f64 * 100.0)
    } else {
        0.0
    };
    Ok(DiskInfo { total, used, available, used_percent })
}

/// `/proc/net/dev`: first non-loopback interface; rx is field 1, tx field 9.
pub fn parse_net_dev(contents: &str) -> Option<NetworkInfo> {
    for line in contents.lines().skip(2) {
        let (name, rest) = line.split_once(':')?;
        let name = name.trim();
        if name == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let rx = fields.first()?.parse().ok()?;
        let tx = fields.get(8)?.parse().ok()?;
        return Some(NetworkInfo { interface: name.to_owned(), rx_bytes: rx, tx_bytes: tx });
    }
    None
}

/// `/proc/uptime`: first number is uptime seconds.
pub fn parse_uptime(contents: &str) -> anyhow::Result<UptimeInfo> {
    let seconds = contents
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty uptime"))?
        .parse::<f64>()? as u64;
    Ok(UptimeInfo { seconds, formatted: format_uptime(seconds) })
}

/// `Xd Yh Zm`; days dropped when 0, hours also dropped when both are 0.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

#[derive(Debug, Deserialize)]
struct DockerPsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "CreatedAt", default)]
    created_at: String,
}

/// One line of `docker ps -a --format '{{json .}}'`.
pub fn parse_docker_ps_line(line: &str) -> Option<ContainerInfo> {
    let raw: DockerPsLine = serde_json::from_str(line).ok()?;
    Some(ContainerInfo {
        id: raw.id,
        name: raw.names.trim_start_matches('/').to_owned(),
        image: raw.image,
        status: raw.status,
        state: raw.state.to_lowercase(),
        created_at: raw.created_at,
        ..ContainerInfo::default()
    })
}

#[derive(Debug, Deserialize)]
struct DockerStatsLine {
    #[serde(rename = "ID", alias = "Container")]
    id: String,
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemPerc", default)]
    mem_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
}

#[derive(Debug, Clone)]
pub struct DockerStats {
    pub id: String,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub mem_usage: String,
}

/// One line of `docker stats --no-stream --format '{{json .}}'`.
pub fn parse_docker_stats_line(line: &str) -> Option<DockerStats> {
    let raw: DockerStatsLine = serde_json::from_str(line).ok()?;
    Some(DockerStats {
        id: raw.id,
        cpu_percent: parse_percent(&raw.cpu_perc),
        mem_percent: parse_percent(&raw.mem_perc),
        mem_usage: raw.mem_usage,
    })
}

fn parse_percent(s: &str) -> f64 {
    s.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Merge stats into ps entries by container id prefix. Containers without
/// stats keep zeroes.
pub fn merge_stats(containers: &mut [ContainerInfo], stats: &HashMap<String, DockerStats>) {
    for container in containers.iter_mut() {
        // `docker stats` may print the short id; match on prefix.
        let found = stats.get(&container.id).or_else(|| {
            stats
                .values()
                .find(|s| container.id.starts_with(&s.id) || s.id.starts_with(&container.id))
        });
        if let Some(s) = found {
            container.cpu_percent = s.cpu_percent;
            container.mem_percent = s.mem_percent;
            container.mem_usage = s.mem_usage.clone();
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
#[path = "sysinfo_tests.rs"]
mod tests;
