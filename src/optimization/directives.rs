/*!
 * Advisory Directives
 * Corrective actions the optimization loop asks an instance to take
 */

use crate::core::types::{Budget, InstanceId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Advice delivered to an instance's template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum Directive {
    /// Scale worker count down to `target_fraction` of current
    ReduceWorkers { target_fraction: f64 },
    EnableThrottling,
    DisableThrottling,
    /// Drop in-memory caches
    EvictCache,
    /// The instance's granted budget changed
    ApplyBudget { budget: Budget },
}

impl Directive {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReduceWorkers { .. } => "reduce_workers",
            Self::EnableThrottling => "enable_throttling",
            Self::DisableThrottling => "disable_throttling",
            Self::EvictCache => "evict_cache",
            Self::ApplyBudget { .. } => "apply_budget",
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReduceWorkers { target_fraction } => {
                write!(f, "reduce_workers({:.2})", target_fraction)
            }
            Self::ApplyBudget { budget } => write!(f, "apply_budget({})", budget),
            other => f.write_str(other.name()),
        }
    }
}

/// Corrective action classes; each has its own deadband and re-arm timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    ReduceCpu,
    ReduceMemory,
    Thermal,
    Rebalance,
}

impl ActionClass {
    pub const ALL: [ActionClass; 4] = [
        ActionClass::ReduceCpu,
        ActionClass::ReduceMemory,
        ActionClass::Thermal,
        ActionClass::Rebalance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ReduceCpu => "reduce_cpu",
            Self::ReduceMemory => "reduce_memory",
            Self::Thermal => "thermal",
            Self::Rebalance => "rebalance",
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A directive addressed to one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedDirective {
    pub instance_id: InstanceId,
    pub class: ActionClass,
    pub directive: Directive,
}
