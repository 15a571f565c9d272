/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use crate::core::types::{InstanceId, Port};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Orchestrator errors with serialization support
///
/// Admission-time variants (`ResourceExhausted`, `PortConflict`, `ThermalUnsafe`,
/// `ConfigInvalid`) are returned before any state is committed.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum OrchestratorError {
    #[error("Resource exhausted: {resource} (requested {requested:.1}, available {available:.1})")]
    #[diagnostic(
        code(admission::resource_exhausted),
        help("Stop or shrink lower-priority instances, or request a smaller budget.")
    )]
    ResourceExhausted {
        resource: String,
        requested: f64,
        available: f64,
    },

    #[error("Port {0} is already bound by a live instance")]
    #[diagnostic(
        code(admission::port_conflict),
        help("Choose another port or omit it to auto-assign one from the configured range.")
    )]
    PortConflict(Port),

    #[error("Host is thermally unsafe to start services: {celsius:.1}°C (limit {limit:.1}°C)")]
    #[diagnostic(
        code(admission::thermal_unsafe),
        help("Wait for the device to cool down before starting new services.")
    )]
    ThermalUnsafe { celsius: f64, limit: f64 },

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(config::invalid))]
    ConfigInvalid(String),

    #[error("Deploy failed for {id}: {reason}")]
    #[diagnostic(code(template::deploy), help("See the instance log for details."))]
    DeployError {
        id: InstanceId,
        reason: String,
        log_location: Option<String>,
    },

    #[error("Start failed for {id}: {reason}")]
    #[diagnostic(code(template::start), help("See the instance log for details."))]
    StartError {
        id: InstanceId,
        reason: String,
        log_location: Option<String>,
    },

    #[error("Stop failed for {id}: {reason}")]
    #[diagnostic(code(template::stop))]
    StopError {
        id: InstanceId,
        reason: String,
        log_location: Option<String>,
    },

    #[error("Delete failed for {id}: {reason}")]
    #[diagnostic(code(template::delete))]
    DeleteError {
        id: InstanceId,
        reason: String,
        log_location: Option<String>,
    },

    #[error("Directive failed for {id}: {reason}")]
    #[diagnostic(code(template::directive))]
    DirectiveFailed { id: InstanceId, reason: String },

    #[error("Health check timed out for {0}")]
    #[diagnostic(code(health::timeout))]
    HealthCheckTimeout(InstanceId),

    #[error("Another operation is in progress for {0}")]
    #[diagnostic(
        code(supervisor::operation_in_progress),
        help("Operations on one instance are serialized; retry once the current one finishes.")
    )]
    OperationInProgress(InstanceId),

    #[error("Instance {0} not found")]
    #[diagnostic(code(supervisor::not_found))]
    NotFound(InstanceId),

    #[error("Operation '{operation}' timed out for {id}")]
    #[diagnostic(code(supervisor::timeout))]
    Timeout { operation: String, id: InstanceId },

    #[error("Invalid state transition for {id}: {from} -> {to}")]
    #[diagnostic(
        code(supervisor::invalid_transition),
        help("Operation cannot be performed in the instance's current state.")
    )]
    InvalidTransition {
        id: InstanceId,
        from: String,
        to: String,
    },

    #[error("No template registered for kind '{0}'")]
    #[diagnostic(code(template::unknown_kind))]
    UnknownTemplate(String),

    #[error("Maintenance task '{0}' not found")]
    #[diagnostic(code(maintenance::not_found))]
    TaskNotFound(String),

    #[error("State store error: {0}")]
    #[diagnostic(code(storage::io))]
    Storage(String),

    #[error("Sampler unavailable: {0}")]
    #[diagnostic(code(monitoring::sampler))]
    SamplerUnavailable(String),
}

impl OrchestratorError {
    /// True for errors that are rejected before anything is committed
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. }
                | Self::PortConflict(_)
                | Self::ThermalUnsafe { .. }
                | Self::ConfigInvalid(_)
        )
    }

    /// Log file a collaborator error points at
    pub fn log_location(&self) -> Option<&str> {
        match self {
            Self::DeployError { log_location, .. }
            | Self::StartError { log_location, .. }
            | Self::StopError { log_location, .. }
            | Self::DeleteError { log_location, .. } => log_location.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn exhausted(resource: &str, requested: f64, available: f64) -> Self {
        Self::ResourceExhausted {
            resource: resource.to_string(),
            requested,
            available,
        }
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}
