/*!
 * Load Sampling
 *
 * Host CPU, memory and network figures from procfs. CPU is reported with the
 * orchestrator's own usage subtracted so that sampling cannot, by itself,
 * push the observed load over an action threshold.
 */

use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::limits::FALLBACK_MEMORY_MB;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, trace};

/// One load observation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSample {
    /// Host CPU busy percent, excluding the orchestrator itself
    pub cpu_percent: f64,
    /// Orchestrator's own CPU percent of the host
    pub self_cpu_percent: f64,
    pub memory_percent: f64,
    #[serde(rename = "memoryUsedMB")]
    pub memory_used_mb: f64,
    #[serde(rename = "networkRxKBps")]
    pub network_rx_kbps: f64,
    #[serde(rename = "networkTxKBps")]
    pub network_tx_kbps: f64,
}

/// Source of load samples
#[async_trait]
pub trait LoadSampler: Send + Sync {
    async fn sample(&self) -> OrchestratorResult<LoadSample>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    cpu: CpuTimes,
    self_jiffies: u64,
    rx_bytes: u64,
    tx_bytes: u64,
    at: Instant,
}

/// procfs-backed sampler; rates are deltas against the previous call
#[derive(Debug, Default)]
pub struct ProcLoadSampler {
    previous: Mutex<Option<Counters>>,
}

impl ProcLoadSampler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoadSampler for ProcLoadSampler {
    async fn sample(&self) -> OrchestratorResult<LoadSample> {
        let stat = read_proc("/proc/stat").await?;
        let self_stat = read_proc("/proc/self/stat").await?;
        let meminfo = read_proc("/proc/meminfo").await?;
        // Network counters are optional (sandboxed hosts may hide them)
        let net_dev = tokio::fs::read_to_string("/proc/net/dev")
            .await
            .unwrap_or_default();

        let cpu = parse_cpu_times(&stat)
            .ok_or_else(|| OrchestratorError::SamplerUnavailable("malformed /proc/stat".into()))?;
        let self_jiffies = parse_self_jiffies(&self_stat).unwrap_or(0);
        let (total_kb, available_kb) = parse_meminfo(&meminfo)
            .ok_or_else(|| OrchestratorError::SamplerUnavailable("malformed /proc/meminfo".into()))?;
        let (rx_bytes, tx_bytes) = parse_net_dev(&net_dev);

        let now = Counters {
            cpu,
            self_jiffies,
            rx_bytes,
            tx_bytes,
            at: Instant::now(),
        };
        let previous = self.previous.lock().replace(now);

        let (cpu_percent, self_cpu_percent, rx_kbps, tx_kbps) = match previous {
            Some(prev) => {
                let d_total = now.cpu.total.saturating_sub(prev.cpu.total);
                let d_idle = now.cpu.idle.saturating_sub(prev.cpu.idle);
                let d_self = now.self_jiffies.saturating_sub(prev.self_jiffies);
                let secs = now.at.duration_since(prev.at).as_secs_f64().max(1e-3);
                let (busy, own) = if d_total == 0 {
                    (0.0, 0.0)
                } else {
                    (
                        d_total.saturating_sub(d_idle) as f64 / d_total as f64 * 100.0,
                        d_self as f64 / d_total as f64 * 100.0,
                    )
                };
                (
                    (busy - own).max(0.0),
                    own,
                    now.rx_bytes.saturating_sub(prev.rx_bytes) as f64 / 1024.0 / secs,
                    now.tx_bytes.saturating_sub(prev.tx_bytes) as f64 / 1024.0 / secs,
                )
            }
            None => {
                // First call: average since boot
                let busy = if cpu.total == 0 {
                    0.0
                } else {
                    cpu.total.saturating_sub(cpu.idle) as f64 / cpu.total as f64 * 100.0
                };
                (busy, 0.0, 0.0, 0.0)
            }
        };

        let used_kb = total_kb.saturating_sub(available_kb);
        let sample = LoadSample {
            cpu_percent,
            self_cpu_percent,
            memory_percent: if total_kb == 0 {
                0.0
            } else {
                used_kb as f64 / total_kb as f64 * 100.0
            },
            memory_used_mb: used_kb as f64 / 1024.0,
            network_rx_kbps: rx_kbps,
            network_tx_kbps: tx_kbps,
        };
        trace!(?sample, "Load sample");
        Ok(sample)
    }
}

/// Total memory in MB from /proc/meminfo, with a fixed fallback
pub fn detect_total_memory_mb() -> f64 {
    match std::fs::read_to_string("/proc/meminfo")
        .ok()
        .as_deref()
        .and_then(parse_meminfo)
    {
        Some((total_kb, _)) if total_kb > 0 => total_kb as f64 / 1024.0,
        _ => {
            debug!(fallback_mb = FALLBACK_MEMORY_MB, "Cannot read /proc/meminfo, using fallback");
            FALLBACK_MEMORY_MB
        }
    }
}

async fn read_proc(path: &str) -> OrchestratorResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| OrchestratorError::SamplerUnavailable(format!("{}: {}", path, e)))
}

/// Aggregate `cpu` line: user nice system idle iowait irq softirq steal
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|f| f.parse().ok())
        .collect::<Option<Vec<u64>>>()?;
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        total: fields.iter().sum(),
        idle,
    })
}

/// utime + stime of the current process
fn parse_self_jiffies(stat: &str) -> Option<u64> {
    // comm may contain spaces; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// (MemTotal, MemAvailable) in kB
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")
        .or_else(|| field("MemFree:"))
        .unwrap_or(0);
    Some((total, available))
}

/// Summed (rx_bytes, tx_bytes) over non-loopback interfaces
fn parse_net_dev(net_dev: &str) -> (u64, u64) {
    net_dev
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (iface, counters) = line.split_once(':')?;
            if iface.trim() == "lo" {
                return None;
            }
            let fields: Vec<&str> = counters.split_whitespace().collect();
            let rx: u64 = fields.first()?.parse().ok()?;
            let tx: u64 = fields.get(8)?.parse().ok()?;
            Some((rx, tx))
        })
        .fold((0, 0), |(rx, tx), (r, t)| (rx + r, tx + t))
}
