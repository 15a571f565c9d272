/*!
 * Instance Module
 * Service instance model, lifecycle edges and the shared instance table
 */

pub mod history;
pub mod lifecycle;
pub mod table;
pub mod types;

// Re-export for convenience
pub use history::{HealthHistory, HealthSummary, ProbeOutcome, ProbeRecord};
pub use lifecycle::{can_transition, validate_transition};
pub use table::InstanceTable;
pub use types::{
    BudgetView, DeploymentStage, ErrorRecord, InstanceSpec, InstanceStatus, InstanceStatusReport,
    InstanceSummary, RecoveryState, ServiceInstance,
};
