/*!
 * Health Monitor
 *
 * Probes every running instance on a fixed interval. Probes for different
 * instances run concurrently; an instance whose previous probe is still in
 * flight, or which is busy with a lifecycle operation, is skipped for that
 * round. Crossing the failure threshold degrades the instance and hands it
 * to the recovery coordinator.
 */

use super::probe::{probe_within, Prober};
use crate::core::config::HealthConfig;
use crate::core::errors::OrchestratorError;
use crate::core::periodic::PeriodicJob;
use crate::core::types::InstanceId;
use crate::instance::{InstanceStatus, ProbeOutcome};
use crate::process::ProcessSupervisor;
use crate::recovery::RecoveryCoordinator;
use ahash::RandomState;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one probe round for one instance
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub id: InstanceId,
    pub outcome: ProbeOutcome,
    pub consecutive_failures: u32,
    /// The failure threshold was crossed and the instance degraded
    pub degraded: bool,
    /// `HealthCheckTimeout` when the probe did not answer; counted as a failure
    pub error: Option<OrchestratorError>,
}

pub struct HealthMonitor {
    supervisor: Arc<ProcessSupervisor>,
    recovery: Arc<RecoveryCoordinator>,
    prober: Arc<dyn Prober>,
    config: HealthConfig,
    in_flight: DashMap<InstanceId, (), RandomState>,
}

/// Removes the in-flight marker when the probe finishes
struct InFlight<'a> {
    map: &'a DashMap<InstanceId, (), RandomState>,
    id: InstanceId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.id);
    }
}

impl HealthMonitor {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        recovery: Arc<RecoveryCoordinator>,
        prober: Arc<dyn Prober>,
        config: HealthConfig,
    ) -> Self {
        Self {
            supervisor,
            recovery,
            prober,
            config,
            in_flight: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Probe all running instances once
    pub async fn check_all(&self) -> Vec<ProbeReport> {
        let running = self
            .supervisor
            .table()
            .ids_with_status(InstanceStatus::Running);
        let reports = join_all(running.iter().map(|id| self.check_instance(id))).await;
        reports.into_iter().flatten().collect()
    }

    /// Probe one instance; `None` when skipped
    pub async fn check_instance(&self, id: &InstanceId) -> Option<ProbeReport> {
        if self.supervisor.guards().is_busy(id) {
            debug!(instance_id = %id, "Instance busy, probe skipped");
            return None;
        }
        if self.in_flight.insert(id.clone(), ()).is_some() {
            debug!(instance_id = %id, "Probe already in flight");
            return None;
        }
        let _marker = InFlight {
            map: &self.in_flight,
            id: id.clone(),
        };

        let target = match self.supervisor.probe_target(id) {
            Ok(target) => target,
            Err(e) => {
                debug!(instance_id = %id, error = %e, "No probe target");
                return None;
            }
        };
        let outcome = probe_within(self.prober.as_ref(), &target, self.config.probe_timeout).await;
        let error = matches!(outcome, ProbeOutcome::TimedOut)
            .then(|| OrchestratorError::HealthCheckTimeout(id.clone()));

        // Stopped or deleted while probing
        if self.supervisor.table().status(id) != Some(InstanceStatus::Running) {
            return None;
        }

        let failures = match self.supervisor.record_probe(id, outcome.clone()) {
            Ok(failures) => failures,
            Err(_) => return None,
        };

        let mut degraded = false;
        if failures >= self.config.failure_threshold {
            warn!(
                instance_id = %id,
                consecutive_failures = failures,
                last = %outcome,
                "Failure threshold crossed"
            );
            match self.supervisor.mark_degraded(id).await {
                Ok(true) => {
                    degraded = true;
                    self.recovery.schedule(id.clone());
                }
                Ok(false) => debug!(instance_id = %id, "Degrade skipped"),
                Err(e) => warn!(instance_id = %id, error = %e, "Could not degrade instance"),
            }
        } else if let Some(e) = &error {
            debug!(instance_id = %id, consecutive_failures = failures, error = %e, "Probe failed");
        } else if !outcome.is_healthy() {
            debug!(instance_id = %id, consecutive_failures = failures, outcome = %outcome, "Probe failed");
        }

        Some(ProbeReport {
            id: id.clone(),
            outcome,
            consecutive_failures: failures,
            degraded,
            error,
        })
    }
}

#[async_trait]
impl PeriodicJob for HealthMonitor {
    fn name(&self) -> &'static str {
        "health"
    }

    async fn tick(&self) {
        let reports = self.check_all().await;
        if !reports.is_empty() {
            debug!(probed = reports.len(), "Health round complete");
        }
    }
}
