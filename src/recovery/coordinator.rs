/*!
 * Recovery Coordinator
 *
 * One task per recovery episode. The task sleeps without holding the
 * instance's operation guard and takes it only to run an attempt, so a user
 * stop can always abort it between attempts.
 */

use super::backoff::{BackoffPolicy, RecoveryDecision};
use crate::core::config::RecoveryConfig;
use crate::core::types::{InstanceId, TimestampMs};
use crate::events::FleetEvent;
use crate::instance::InstanceStatus;
use crate::process::ProcessSupervisor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct RecoveryCoordinator {
    supervisor: Arc<ProcessSupervisor>,
    policy: BackoffPolicy,
    retry_after_cooldown: bool,
}

impl RecoveryCoordinator {
    pub fn new(supervisor: Arc<ProcessSupervisor>, config: &RecoveryConfig) -> Self {
        Self {
            supervisor,
            policy: BackoffPolicy::from_config(config),
            retry_after_cooldown: config.retry_after_cooldown,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Start (or resume) recovery for `id`, replacing any pending episode
    pub fn schedule(self: &Arc<Self>, id: InstanceId) {
        let timers = self.supervisor.timers().clone();
        let generation = timers.next_generation();
        let coordinator = Arc::clone(self);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            coordinator.run(&task_id).await;
            coordinator.supervisor.timers().finish(&task_id, generation);
        });
        timers.arm(&id, generation, handle);
    }

    /// Hand an instance whose manual start failed mid-episode back to the
    /// cooldown path
    pub async fn requeue(self: &Arc<Self>, id: &InstanceId) {
        if !self.retry_after_cooldown || self.supervisor.timers().is_pending(id) {
            return;
        }
        let cooldown_until = self.supervisor.clock().now_ms()
            + self.policy.cooldown.as_millis() as TimestampMs;
        match self.supervisor.arm_cooldown(id, cooldown_until).await {
            Ok(true) => {
                info!(instance_id = %id, cooldown_until, "Manual start failed, recovery requeued");
                self.schedule(id.clone());
            }
            Ok(false) => {}
            Err(e) => warn!(instance_id = %id, error = %e, "Could not requeue recovery"),
        }
    }

    async fn run(&self, id: &InstanceId) {
        let clock = Arc::clone(self.supervisor.clock());
        let mut anchor = clock.now_ms();
        let mut not_before: Option<TimestampMs> = None;

        loop {
            let Some(instance) = self.supervisor.table().get(id) else {
                debug!(instance_id = %id, "Instance gone, recovery ends");
                return;
            };
            let now = clock.now_ms();

            match instance.status {
                InstanceStatus::Degraded => match self.supervisor.begin_recovery(id).await {
                    Ok(true) => anchor = clock.now_ms(),
                    Ok(false) => return,
                    Err(e) => {
                        warn!(instance_id = %id, error = %e, "Could not enter recovery");
                        return;
                    }
                },

                InstanceStatus::Recovering => {
                    match self.policy.decide(&instance.recovery_state, now) {
                        RecoveryDecision::Attempt { attempt, delay } => {
                            let from = instance.recovery_state.last_attempt_at.unwrap_or(anchor);
                            let due = from + delay.as_millis() as TimestampMs;
                            let wait_ms = due.saturating_sub(now);
                            info!(instance_id = %id, attempt, wait_ms, "Recovery attempt scheduled");
                            self.supervisor.events().emit(FleetEvent::RecoveryScheduled {
                                id: id.clone(),
                                attempt,
                                delay_ms: wait_ms,
                            });
                            sleep_ms(wait_ms).await;

                            match self.supervisor.recovery_attempt(id).await {
                                Ok(true) => return,
                                Ok(false) => {}
                                Err(e) => {
                                    debug!(instance_id = %id, error = %e, "Recovery interrupted");
                                    return;
                                }
                            }
                        }
                        RecoveryDecision::Exhausted { cooldown_until }
                        | RecoveryDecision::CoolingDown {
                            until: cooldown_until,
                        } => {
                            if let Err(e) = self.supervisor.fail_recovery(id, cooldown_until).await {
                                error!(instance_id = %id, error = %e, "Could not mark recovery failed");
                                return;
                            }
                            self.supervisor.events().emit(FleetEvent::RecoveryExhausted {
                                id: id.clone(),
                                cooldown_until,
                            });
                            if !self.retry_after_cooldown {
                                return;
                            }
                        }
                    }
                }

                InstanceStatus::Failed if self.retry_after_cooldown => {
                    let Some(until) = instance.recovery_state.cooldown_until else {
                        return;
                    };
                    let due = until.max(not_before.unwrap_or(0));
                    sleep_ms(due.saturating_sub(now)).await;

                    match self.supervisor.restart_recovery_cycle(id).await {
                        Ok(true) => {
                            anchor = clock.now_ms();
                            not_before = None;
                        }
                        Ok(false) => return,
                        Err(e) => {
                            let retry_at = clock.now_ms() + self.policy.cooldown.as_millis() as TimestampMs;
                            warn!(instance_id = %id, error = %e, retry_at, "Re-admission after cooldown failed");
                            not_before = Some(retry_at);
                        }
                    }
                }

                _ => return,
            }
        }
    }
}

async fn sleep_ms(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}
