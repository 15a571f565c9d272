/*!
 * Recovery Backoff
 *
 * Pure decision logic for bounded, exponentially backed-off restarts. The
 * coordinator asks `decide` what to do next given the persisted recovery
 * state and the current time.
 */

use crate::core::config::RecoveryConfig;
use crate::core::types::TimestampMs;
use crate::instance::RecoveryState;
use std::time::Duration;

/// Next step for an instance in recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Run attempt number `attempt` (1-based) `delay` after the previous one
    Attempt { attempt: u32, delay: Duration },
    /// Attempts are used up; stay failed until `cooldown_until`
    Exhausted { cooldown_until: TimestampMs },
    /// Still inside the cooldown window
    CoolingDown { until: TimestampMs },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: f64,
    pub cooldown: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: config.backoff_base,
            factor: config.backoff_factor,
            cooldown: config.cooldown,
        }
    }

    /// `base * factor^(attempt - 1)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        self.base.mul_f64(self.factor.powi(exponent))
    }

    pub fn decide(&self, state: &RecoveryState, now: TimestampMs) -> RecoveryDecision {
        if let Some(until) = state.cooldown_until {
            if now < until {
                return RecoveryDecision::CoolingDown { until };
            }
        }
        if state.attempt_count >= self.max_attempts {
            let from = state.last_attempt_at.unwrap_or(now);
            return RecoveryDecision::Exhausted {
                cooldown_until: from + self.cooldown.as_millis() as TimestampMs,
            };
        }
        let attempt = state.attempt_count + 1;
        RecoveryDecision::Attempt {
            attempt,
            delay: self.delay_for(attempt),
        }
    }
}
