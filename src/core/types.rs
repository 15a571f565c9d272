/*!
 * Core Types
 * Common types used across the orchestrator
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Listening port type
pub type Port = u16;

/// Wall-clock timestamp in milliseconds since the UNIX epoch
pub type TimestampMs = u64;

/// Opaque unique identifier of a service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(format!("svc-{}", uuid::Uuid::new_v4().simple()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Scheduling priority of an instance
///
/// Ordered Low < Medium < High so that comparisons read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(name)
    }
}

/// One dimension of a resource budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Cpu,
    Memory,
    Bandwidth,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Cpu, Resource::Memory, Resource::Bandwidth];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Bandwidth => "bandwidth",
        }
    }
}

/// Comparison slack for floating point budget arithmetic
const BUDGET_EPSILON: f64 = 1e-6;

/// CPU / memory / bandwidth allocation
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub cpu_percent: f64,
    #[serde(rename = "memoryMB")]
    pub memory_mb: f64,
    #[serde(rename = "bandwidthKBps")]
    pub bandwidth_kbps: f64,
}

impl Budget {
    pub const ZERO: Budget = Budget {
        cpu_percent: 0.0,
        memory_mb: 0.0,
        bandwidth_kbps: 0.0,
    };

    pub fn new(cpu_percent: f64, memory_mb: f64, bandwidth_kbps: f64) -> Self {
        Self {
            cpu_percent,
            memory_mb,
            bandwidth_kbps,
        }
    }

    #[inline]
    pub fn get(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Cpu => self.cpu_percent,
            Resource::Memory => self.memory_mb,
            Resource::Bandwidth => self.bandwidth_kbps,
        }
    }

    #[inline]
    pub fn set(&mut self, resource: Resource, value: f64) {
        match resource {
            Resource::Cpu => self.cpu_percent = value,
            Resource::Memory => self.memory_mb = value,
            Resource::Bandwidth => self.bandwidth_kbps = value,
        }
    }

    pub fn add(&self, other: &Budget) -> Budget {
        self.zip(other, |a, b| a + b)
    }

    /// Component-wise subtraction, floored at zero
    pub fn saturating_sub(&self, other: &Budget) -> Budget {
        self.zip(other, |a, b| (a - b).max(0.0))
    }

    pub fn scale(&self, factor: f64) -> Budget {
        self.map(|v| v * factor)
    }

    pub fn min(&self, other: &Budget) -> Budget {
        self.zip(other, f64::min)
    }

    /// True when every component is within `limit`
    pub fn fits_within(&self, limit: &Budget) -> bool {
        Resource::ALL
            .iter()
            .all(|r| self.get(*r) <= limit.get(*r) + BUDGET_EPSILON)
    }

    /// Components of `self` that exceed `limit`, with the overshoot
    pub fn excess_over(&self, limit: &Budget) -> Budget {
        self.zip(limit, |a, b| if a > b + BUDGET_EPSILON { a - b } else { 0.0 })
    }

    pub fn is_valid(&self) -> bool {
        Resource::ALL.iter().all(|r| {
            let v = self.get(*r);
            v.is_finite() && v >= 0.0
        })
    }

    pub fn is_zero(&self) -> bool {
        Resource::ALL.iter().all(|r| self.get(*r).abs() <= BUDGET_EPSILON)
    }

    /// True when any dimension differs from `other` by more than its tolerance
    pub fn exceeds_tolerance(&self, other: &Budget, tolerance: &Budget) -> bool {
        Resource::ALL
            .iter()
            .any(|r| (self.get(*r) - other.get(*r)).abs() > tolerance.get(*r) + BUDGET_EPSILON)
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Budget {
        Budget {
            cpu_percent: f(self.cpu_percent),
            memory_mb: f(self.memory_mb),
            bandwidth_kbps: f(self.bandwidth_kbps),
        }
    }

    fn zip(&self, other: &Budget, f: impl Fn(f64, f64) -> f64) -> Budget {
        Budget {
            cpu_percent: f(self.cpu_percent, other.cpu_percent),
            memory_mb: f(self.memory_mb, other.memory_mb),
            bandwidth_kbps: f(self.bandwidth_kbps, other.bandwidth_kbps),
        }
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={:.1}% mem={:.0}MB bw={:.0}KBps",
            self.cpu_percent, self.memory_mb, self.bandwidth_kbps
        )
    }
}
