/*!
 * Fleet Events
 * Broadcast stream of everything observable that happens to the fleet
 */

use crate::core::types::{Budget, InstanceId, Port, TimestampMs};
use crate::instance::{InstanceStatus, ProbeOutcome};
use crate::optimization::{ActionClass, Directive};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    InstanceCreated {
        id: InstanceId,
        port: Port,
        granted: Budget,
    },
    StatusChanged {
        id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
        at: TimestampMs,
    },
    ProbeCompleted {
        id: InstanceId,
        outcome: ProbeOutcome,
        consecutive_failures: u32,
    },
    RecoveryScheduled {
        id: InstanceId,
        attempt: u32,
        delay_ms: u64,
    },
    RecoveryAttempted {
        id: InstanceId,
        attempt: u32,
        success: bool,
    },
    RecoveryExhausted {
        id: InstanceId,
        cooldown_until: TimestampMs,
    },
    BudgetChanged {
        id: InstanceId,
        from: Budget,
        to: Budget,
    },
    DirectiveIssued {
        id: InstanceId,
        class: ActionClass,
        directive: Directive,
    },
    InstanceDeleted {
        id: InstanceId,
    },
    MaintenanceRun {
        task: String,
        success: bool,
    },
}

/// Cloneable sender side of the event stream
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    /// Publish; having no subscribers is fine
    pub fn emit(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }
}
