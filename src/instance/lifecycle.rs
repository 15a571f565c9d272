/*!
 * Instance Lifecycle
 *
 * The legal edges of the instance state machine:
 *
 * ```text
 * Created -> Allocating -> Deploying -> Running
 * Running -> Stopping -> Stopped
 * Running -> Degraded -> Recovering -> Running | Failed
 * Stopped | Failed -> Allocating          (explicit start / restart)
 * Failed -> Recovering                    (fresh cycle after cooldown)
 * Allocating | Deploying -> Failed
 * Stopping -> Failed                      (stop timed out)
 * Degraded | Recovering -> Stopping       (explicit stop wins over recovery)
 * any -> Deleted
 * ```
 */

use super::types::InstanceStatus;
use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::types::InstanceId;

use InstanceStatus::*;

/// Whether `from -> to` is an edge of the state machine
pub fn can_transition(from: InstanceStatus, to: InstanceStatus) -> bool {
    if from == Deleted {
        return false;
    }
    if to == Deleted {
        return true;
    }
    matches!(
        (from, to),
        (Created, Allocating)
            | (Allocating, Deploying)
            | (Allocating, Failed)
            | (Deploying, Running)
            | (Deploying, Failed)
            | (Running, Stopping)
            | (Running, Degraded)
            | (Stopping, Stopped)
            | (Stopping, Failed)
            | (Degraded, Recovering)
            | (Degraded, Stopping)
            | (Recovering, Running)
            | (Recovering, Failed)
            | (Recovering, Stopping)
            | (Stopped, Allocating)
            | (Failed, Allocating)
            | (Failed, Recovering)
    )
}

/// Validate an edge, producing `InvalidTransition` otherwise
pub fn validate_transition(
    id: &InstanceId,
    from: InstanceStatus,
    to: InstanceStatus,
) -> OrchestratorResult<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidTransition {
            id: id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
