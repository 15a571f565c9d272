/*!
 * Instance Types
 * The service instance record and the views handed to callers
 */

use super::history::{HealthHistory, HealthSummary};
use crate::core::serde::{is_false, is_none, is_zero_u32};
use crate::core::types::{Budget, InstanceId, Port, Priority, TimestampMs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Created,
    Allocating,
    Deploying,
    Running,
    Stopping,
    Stopped,
    Degraded,
    Recovering,
    Failed,
    Deleted,
}

impl InstanceStatus {
    /// Terminal states hold no budget
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Deleted)
    }

    /// States in which a granted budget is reserved in the ledger
    #[inline]
    pub fn holds_budget(&self) -> bool {
        !self.is_terminal()
    }

    /// States in which the instance may own a live OS process
    #[inline]
    pub fn may_have_process(&self) -> bool {
        matches!(
            self,
            Self::Deploying | Self::Running | Self::Degraded | Self::Recovering | Self::Stopping
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Allocating => "allocating",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Degraded => "degraded",
            Self::Recovering => "recovering",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Informational provisioning progress; not part of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStage {
    Initializing,
    Allocating,
    Deploying,
    Verifying,
    Completed,
    Failed,
}

/// Recovery bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryState {
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "is_none")]
    pub last_attempt_at: Option<TimestampMs>,
    #[serde(default, skip_serializing_if = "is_none")]
    pub cooldown_until: Option<TimestampMs>,
}

impl RecoveryState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Last collaborator error, with where to find its log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,
    #[serde(default, skip_serializing_if = "is_none")]
    pub log_location: Option<String>,
    pub at: TimestampMs,
}

/// Creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub template_kind: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    pub budget: Budget,
    #[serde(default)]
    pub priority: Priority,
    /// `None` means auto-assign
    #[serde(default)]
    pub port: Option<Port>,
}

impl InstanceSpec {
    pub fn new(template_kind: impl Into<String>, budget: Budget) -> Self {
        Self {
            template_kind: template_kind.into(),
            budget,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: Port) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// A managed service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: InstanceId,
    pub name: String,
    pub template_kind: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// What the caller asked for
    pub requested: Budget,
    /// What the ledger currently grants (<= requested)
    pub granted: Budget,
    pub priority: Priority,
    pub port: Port,
    pub status: InstanceStatus,
    pub deployment_stage: DeploymentStage,
    /// Last known OS pid, kept so a restarted orchestrator can adopt the process
    #[serde(default, skip_serializing_if = "is_none")]
    pub pid: Option<u32>,
    pub health_history: HealthHistory,
    #[serde(default)]
    pub recovery_state: RecoveryState,
    /// First-time provisioning has completed
    #[serde(default, skip_serializing_if = "is_false")]
    pub deployed: bool,
    #[serde(default, skip_serializing_if = "is_none")]
    pub last_error: Option<ErrorRecord>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl ServiceInstance {
    pub fn new(
        id: InstanceId,
        spec: &InstanceSpec,
        port: Port,
        granted: Budget,
        history_capacity: usize,
        now: TimestampMs,
    ) -> Self {
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", spec.template_kind, port));
        Self {
            id,
            name,
            template_kind: spec.template_kind.clone(),
            config: spec.config.clone(),
            requested: spec.budget,
            granted,
            priority: spec.priority,
            port,
            status: InstanceStatus::Created,
            deployment_stage: DeploymentStage::Initializing,
            pid: None,
            health_history: HealthHistory::new(history_capacity),
            recovery_state: RecoveryState::default(),
            deployed: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            priority: self.priority,
            budget: self.granted,
            port: self.port,
        }
    }

    pub fn status_report(&self) -> InstanceStatusReport {
        InstanceStatusReport {
            id: self.id.clone(),
            status: self.status,
            deployment_stage: self.deployment_stage,
            budget: BudgetView {
                requested: self.requested,
                granted: self.granted,
            },
            health_summary: self.health_history.summary(),
            recovery_state: self.recovery_state.clone(),
            port: self.port,
            last_error: self.last_error.clone(),
        }
    }
}

/// Requested vs. granted budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetView {
    pub requested: Budget,
    pub granted: Budget,
}

/// Answer to `getStatus`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatusReport {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub deployment_stage: DeploymentStage,
    pub budget: BudgetView,
    pub health_summary: HealthSummary,
    pub recovery_state: RecoveryState,
    pub port: Port,
    pub last_error: Option<ErrorRecord>,
}

/// Row of `listInstances`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub name: String,
    pub status: InstanceStatus,
    pub priority: Priority,
    pub budget: Budget,
    pub port: Port,
}
