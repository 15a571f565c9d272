/*!
 * Fleet Orchestrator Library
 * Resource-aware orchestration and self-healing for services on one constrained host
 */

pub mod core;
pub mod events;
pub mod health;
pub mod instance;
pub mod maintenance;
pub mod monitoring;
pub mod optimization;
pub mod orchestrator;
pub mod process;
pub mod recovery;
pub mod resources;
pub mod storage;
pub mod template;

// Re-exports
pub use crate::core::{
    Budget, Clock, InstanceId, ManualClock, OrchestratorConfig, OrchestratorError,
    OrchestratorResult, Port, Priority, SystemClock, TimestampMs, TokioClock,
};
pub use events::{EventBus, FleetEvent};
pub use health::{HealthMonitor, NetworkProber, ProbeSpec, ProbeTarget, Prober};
pub use instance::{
    InstanceSpec, InstanceStatus, InstanceStatusReport, InstanceSummary, ProbeOutcome,
    ServiceInstance,
};
pub use maintenance::{MaintenanceScheduler, MaintenanceTask, Schedule};
pub use monitoring::{init_tracing, LoadSample, LoadSampler, StaticThermalSampler, ThermalSampler};
pub use optimization::{ActionClass, Directive, OptimizationEngine};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RestoreReport, SystemSnapshot};
pub use process::ProcessSupervisor;
pub use recovery::{BackoffPolicy, RecoveryCoordinator};
pub use template::{CommandTemplate, ServiceTemplate, TemplateContext, TemplateError};
