/*!
 * Admission Controller
 *
 * Decides whether a new or restarting instance may be granted its budget.
 * Checks run port, then thermal, then budget; the port is only kept when every
 * check passes, so a rejection leaves no trace in either registry.
 */

use super::ledger::ResourceLedger;
use super::ports::PortRegistry;
use super::rebalance::BudgetChange;
use crate::core::config::ThermalConfig;
use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::types::{Budget, InstanceId, Port, Priority};
use crate::instance::InstanceSpec;
use crate::monitoring::ThermalSampler;
use std::sync::Arc;
use tracing::{info, warn};

/// A granted admission
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub port: Port,
    pub granted: Budget,
    /// Lower-priority grants shrunk to make room
    pub reclaimed: Vec<BudgetChange>,
}

pub struct AdmissionController {
    ledger: Arc<ResourceLedger>,
    ports: Arc<PortRegistry>,
    thermal: Arc<dyn ThermalSampler>,
    thermal_config: ThermalConfig,
}

impl AdmissionController {
    pub fn new(
        ledger: Arc<ResourceLedger>,
        ports: Arc<PortRegistry>,
        thermal: Arc<dyn ThermalSampler>,
        thermal_config: ThermalConfig,
    ) -> Self {
        Self {
            ledger,
            ports,
            thermal,
            thermal_config,
        }
    }

    /// Admit a brand-new instance: reserve its port and debit its budget
    pub async fn admit_new(
        &self,
        id: &InstanceId,
        spec: &InstanceSpec,
    ) -> OrchestratorResult<Admission> {
        validate_spec(spec)?;

        let port = self.ports.reserve(id, spec.port)?;

        if let Err(e) = self.check_thermal().await {
            self.ports.release(port, id);
            return Err(e);
        }

        match self.ledger.admit(id, spec.priority, spec.budget) {
            Ok(admitted) => {
                info!(
                    instance_id = %id,
                    port,
                    granted = %admitted.granted,
                    priority = %spec.priority,
                    "Instance admitted"
                );
                Ok(Admission {
                    port,
                    granted: admitted.granted,
                    reclaimed: admitted.reclaimed,
                })
            }
            Err(e) => {
                self.ports.release(port, id);
                Err(e)
            }
        }
    }

    /// Re-admit an existing instance whose grant was credited (Stopped/Failed)
    pub async fn readmit(
        &self,
        id: &InstanceId,
        priority: Priority,
        requested: Budget,
    ) -> OrchestratorResult<(Budget, Vec<BudgetChange>)> {
        self.check_thermal().await?;
        let admitted = self.ledger.admit(id, priority, requested)?;
        info!(instance_id = %id, granted = %admitted.granted, "Instance re-admitted");
        Ok((admitted.granted, admitted.reclaimed))
    }

    /// Reject when the host is too hot to start anything.
    /// Returns the reading that was used, if any.
    pub async fn check_thermal(&self) -> OrchestratorResult<Option<f64>> {
        let limit = self.thermal_config.unsafe_to_start_celsius;
        match self.thermal.read_celsius().await {
            Some(celsius) if celsius >= limit => {
                warn!(celsius, limit, "Admission rejected: thermally unsafe");
                Err(OrchestratorError::ThermalUnsafe { celsius, limit })
            }
            Some(celsius) => Ok(Some(celsius)),
            None if self.thermal_config.reject_on_unknown => {
                warn!("Admission rejected: temperature unknown");
                Err(OrchestratorError::ThermalUnsafe {
                    celsius: f64::NAN,
                    limit,
                })
            }
            None => Ok(None),
        }
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }
}

fn validate_spec(spec: &InstanceSpec) -> OrchestratorResult<()> {
    if spec.template_kind.trim().is_empty() {
        return Err(OrchestratorError::ConfigInvalid(
            "template kind must not be empty".into(),
        ));
    }
    if !spec.budget.is_valid() {
        return Err(OrchestratorError::ConfigInvalid(format!(
            "budget must be finite and non-negative: {}",
            spec.budget
        )));
    }
    if spec.budget.is_zero() {
        return Err(OrchestratorError::ConfigInvalid(
            "budget must request at least one resource".into(),
        ));
    }
    Ok(())
}
