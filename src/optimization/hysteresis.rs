/*!
 * Hysteresis Triggers
 *
 * An action engages when the smoothed metric rises above `high` and stays
 * engaged until the metric falls below `low`. Only a released trigger may
 * fire again, and never before its re-arm interval has passed. Values inside
 * the deadband change nothing.
 */

use crate::core::config::Deadband;
use crate::core::types::TimestampMs;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum spacing between two firings of one action class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RearmGate {
    interval_ms: u64,
    last_fired: Option<TimestampMs>,
}

impl RearmGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_fired: None,
        }
    }

    #[inline]
    pub fn is_ready(&self, now: TimestampMs) -> bool {
        match self.last_fired {
            Some(at) => now.saturating_sub(at) >= self.interval_ms,
            None => true,
        }
    }

    pub fn fire(&mut self, now: TimestampMs) {
        self.last_fired = Some(now);
    }

    #[inline]
    pub fn last_fired(&self) -> Option<TimestampMs> {
        self.last_fired
    }

    pub fn ready_at(&self) -> Option<TimestampMs> {
        self.last_fired.map(|at| at + self.interval_ms)
    }
}

/// What a trigger decided for one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    Idle,
    /// Above `high` and re-armed: take the corrective action
    Fire,
    /// Fell below `low` after having fired: undo it
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HysteresisTrigger {
    band: Deadband,
    gate: RearmGate,
    engaged: bool,
}

impl HysteresisTrigger {
    pub fn new(band: Deadband, rearm: Duration) -> Self {
        Self {
            band,
            gate: RearmGate::new(rearm),
            engaged: false,
        }
    }

    pub fn observe(&mut self, value: f64, now: TimestampMs) -> TriggerEvent {
        if !value.is_finite() {
            return TriggerEvent::Idle;
        }
        if value > self.band.high {
            if !self.engaged && self.gate.is_ready(now) {
                self.gate.fire(now);
                self.engaged = true;
                return TriggerEvent::Fire;
            }
            return TriggerEvent::Idle;
        }
        if value < self.band.low && self.engaged {
            self.engaged = false;
            return TriggerEvent::Release;
        }
        TriggerEvent::Idle
    }

    #[inline]
    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    pub fn gate(&self) -> &RearmGate {
        &self.gate
    }

    pub fn band(&self) -> Deadband {
        self.band
    }
}

/// Reportable trigger state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatus {
    pub engaged: bool,
    pub last_fired_at: Option<TimestampMs>,
    pub rearmed_at: Option<TimestampMs>,
    pub ready: bool,
}

impl TriggerStatus {
    pub fn of_gate(gate: &RearmGate, engaged: bool, now: TimestampMs) -> Self {
        Self {
            engaged,
            last_fired_at: gate.last_fired(),
            rearmed_at: gate.ready_at(),
            ready: gate.is_ready(now),
        }
    }
}
