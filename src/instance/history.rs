/*!
 * Health History
 * Fixed-capacity ring of probe outcomes with a consecutive-failure counter
 */

use crate::core::types::TimestampMs;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Result of a single health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Healthy { latency_ms: u64 },
    Unhealthy { reason: String },
    /// The probe did not answer within its timeout
    TimedOut,
}

impl ProbeOutcome {
    #[inline]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self::Unhealthy {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy { latency_ms } => write!(f, "healthy ({}ms)", latency_ms),
            Self::Unhealthy { reason } => f.write_str(reason),
            Self::TimedOut => f.write_str("probe timed out"),
        }
    }
}

/// Timestamped probe outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub at: TimestampMs,
    pub outcome: ProbeOutcome,
}

/// Bounded probe history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthHistory {
    capacity: usize,
    records: VecDeque<ProbeRecord>,
    consecutive_failures: u32,
}

impl HealthHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
            consecutive_failures: 0,
        }
    }

    /// Append an outcome, evicting the oldest when full.
    /// Returns the consecutive-failure count after the push.
    pub fn push(&mut self, at: TimestampMs, outcome: ProbeOutcome) -> u32 {
        if outcome.is_healthy() {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(ProbeRecord { at, outcome });
        self.consecutive_failures
    }

    /// Forget the failure streak (fresh start after a restart)
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    #[inline]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&ProbeRecord> {
        self.records.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProbeRecord> {
        self.records.iter()
    }

    pub fn summary(&self) -> HealthSummary {
        let healthy = self.records.iter().filter(|r| r.outcome.is_healthy()).count();
        let success_rate = if self.records.is_empty() {
            None
        } else {
            Some(healthy as f64 / self.records.len() as f64)
        };
        HealthSummary {
            consecutive_failures: self.consecutive_failures,
            last_outcome: self.last().map(|r| r.outcome.clone()),
            last_probe_at: self.last().map(|r| r.at),
            success_rate,
            samples: self.records.len(),
        }
    }
}

/// Condensed view of a health history for status reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub consecutive_failures: u32,
    pub last_outcome: Option<ProbeOutcome>,
    pub last_probe_at: Option<TimestampMs>,
    pub success_rate: Option<f64>,
    pub samples: usize,
}
