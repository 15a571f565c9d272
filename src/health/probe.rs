/*!
 * Health Probes
 * Protocol-specific liveness checks, each bounded by its own timeout
 */

use crate::core::types::{InstanceId, Port};
use crate::instance::ProbeOutcome;
use crate::process::pid_alive;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// How an instance is checked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// GET `path` and expect `expected_status`
    Http { path: String, expected_status: u16 },
    /// The instance port accepts connections
    Tcp,
    /// The owned OS process is running
    ProcessAlive,
}

impl ProbeSpec {
    pub fn http(path: impl Into<String>) -> Self {
        Self::Http {
            path: path.into(),
            expected_status: 200,
        }
    }
}

/// Everything a prober needs to check one instance
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTarget {
    pub id: InstanceId,
    pub port: Port,
    pub pid: Option<u32>,
    pub spec: ProbeSpec,
}

/// Executes probes
#[async_trait]
pub trait Prober: Send + Sync {
    /// Never errors: every failure mode is a `ProbeOutcome`
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> ProbeOutcome;
}

/// Run `prober` with a hard deadline, whatever the prober does internally
pub async fn probe_within(prober: &dyn Prober, target: &ProbeTarget, timeout: Duration) -> ProbeOutcome {
    tokio::time::timeout(timeout, prober.probe(target, timeout))
        .await
        .unwrap_or(ProbeOutcome::TimedOut)
}

/// Real network/process prober against localhost
pub struct NetworkProber {
    host: String,
    client: reqwest::Client,
}

impl NetworkProber {
    pub fn new() -> Self {
        Self::with_host("127.0.0.1")
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn run(&self, target: &ProbeTarget) -> ProbeOutcome {
        let started = Instant::now();
        let healthy = || ProbeOutcome::Healthy {
            latency_ms: started.elapsed().as_millis() as u64,
        };

        match &target.spec {
            ProbeSpec::Http {
                path,
                expected_status,
            } => {
                let url = format!("http://{}:{}{}", self.host, target.port, path);
                match self.client.get(&url).send().await {
                    Ok(resp) if resp.status().as_u16() == *expected_status => healthy(),
                    Ok(resp) => ProbeOutcome::unhealthy(format!(
                        "HTTP {} (expected {})",
                        resp.status().as_u16(),
                        expected_status
                    )),
                    Err(e) => ProbeOutcome::unhealthy(format!("HTTP request failed: {}", e)),
                }
            }
            ProbeSpec::Tcp => match TcpStream::connect((self.host.as_str(), target.port)).await {
                Ok(_) => healthy(),
                Err(e) => ProbeOutcome::unhealthy(format!("port {} closed: {}", target.port, e)),
            },
            ProbeSpec::ProcessAlive => match target.pid {
                Some(pid) if pid_alive(pid) => healthy(),
                Some(pid) => ProbeOutcome::unhealthy(format!("process {} is not running", pid)),
                None => ProbeOutcome::unhealthy("no process"),
            },
        }
    }
}

impl Default for NetworkProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> ProbeOutcome {
        match tokio::time::timeout(timeout, self.run(target)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::TimedOut,
        }
    }
}
