/*!
 * Process Supervisor
 *
 * Owns the lifecycle state machine of every instance and the OS handles that
 * go with it. Transitions happen under the instance's operation guard, are
 * validated against the lifecycle edges, then persisted and broadcast.
 * Template calls run under a deadline and panic boundary.
 */

use super::guard::OperationGuards;
use super::handle::ProcessHandle;
use super::timers::RecoveryTimers;
use crate::core::clock::Clock;
use crate::core::config::{HealthConfig, TemplateTimeouts};
use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::guard::{guarded_call, GuardedOutcome};
use crate::core::limits::{STARTUP_PROBE_ATTEMPTS, STARTUP_PROBE_INTERVAL};
use crate::core::types::{Budget, InstanceId, TimestampMs};
use crate::events::{EventBus, FleetEvent};
use crate::health::{probe_within, ProbeTarget, Prober};
use crate::instance::{
    validate_transition, DeploymentStage, ErrorRecord, InstanceSpec,
    InstanceStatus, InstanceStatusReport, InstanceSummary, InstanceTable, ProbeOutcome,
    ServiceInstance,
};
use crate::monitoring::instance_span;
use crate::optimization::Directive;
use crate::resources::{AdmissionController, BudgetChange};
use crate::storage::StateStore;
use crate::template::{ServiceTemplate, TemplateContext, TemplateError, TemplateRegistry};
use ahash::RandomState;
use dashmap::DashMap;
use nix::sys::signal::Signal;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

use InstanceStatus::*;

/// Collaborator capability being invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateOp {
    Deploy,
    Start,
    Stop,
    Delete,
    Directive,
}

impl TemplateOp {
    fn name(self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
            Self::Directive => "directive",
        }
    }

    fn deadline(self, timeouts: &TemplateTimeouts) -> Duration {
        match self {
            Self::Deploy => timeouts.deploy,
            Self::Start => timeouts.start,
            Self::Stop => timeouts.stop,
            Self::Delete => timeouts.delete,
            Self::Directive => timeouts.directive,
        }
    }

    fn error(self, id: &InstanceId, reason: String, log_location: Option<String>) -> OrchestratorError {
        let id = id.clone();
        match self {
            Self::Deploy => OrchestratorError::DeployError {
                id,
                reason,
                log_location,
            },
            Self::Start => OrchestratorError::StartError {
                id,
                reason,
                log_location,
            },
            Self::Stop => OrchestratorError::StopError {
                id,
                reason,
                log_location,
            },
            Self::Delete => OrchestratorError::DeleteError {
                id,
                reason,
                log_location,
            },
            Self::Directive => OrchestratorError::DirectiveFailed { id, reason },
        }
    }
}

/// What a restored instance needs from the background loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    Nothing,
    /// Health monitoring picks it up
    Monitor,
    /// Recovery must be resumed
    Recover,
}

/// Shared collaborators of the supervisor
pub struct SupervisorDeps {
    pub table: InstanceTable,
    pub templates: TemplateRegistry,
    pub admission: Arc<AdmissionController>,
    pub store: Arc<StateStore>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
    pub prober: Arc<dyn Prober>,
}

pub struct ProcessSupervisor {
    table: InstanceTable,
    templates: TemplateRegistry,
    admission: Arc<AdmissionController>,
    store: Arc<StateStore>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    prober: Arc<dyn Prober>,
    guards: OperationGuards,
    timers: RecoveryTimers,
    handles: DashMap<InstanceId, ProcessHandle, RandomState>,
    health: HealthConfig,
    timeouts: TemplateTimeouts,
    log_dir: PathBuf,
}

impl ProcessSupervisor {
    pub fn new(
        deps: SupervisorDeps,
        health: HealthConfig,
        timeouts: TemplateTimeouts,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            table: deps.table,
            templates: deps.templates,
            admission: deps.admission,
            store: deps.store,
            events: deps.events,
            clock: deps.clock,
            prober: deps.prober,
            guards: OperationGuards::new(),
            timers: RecoveryTimers::new(),
            handles: DashMap::with_hasher(RandomState::new()),
            health,
            timeouts,
            log_dir: log_dir.into(),
        }
    }

    // =========================================================================
    // User operations
    // =========================================================================

    /// Admit and register a new instance in `Created`
    pub async fn create(&self, spec: InstanceSpec) -> OrchestratorResult<InstanceId> {
        let template = self.templates.get(&spec.template_kind)?;
        template.validate(&spec.config).map_err(|e| match e {
            TemplateError::InvalidConfig(msg) => OrchestratorError::ConfigInvalid(msg),
            other => OrchestratorError::ConfigInvalid(other.to_string()),
        })?;

        let id = InstanceId::generate();
        let admission = self.admission.admit_new(&id, &spec).await?;
        let instance = ServiceInstance::new(
            id.clone(),
            &spec,
            admission.port,
            admission.granted,
            self.health.history_capacity,
            self.clock.now_ms(),
        );
        info!(
            instance_id = %id,
            name = %instance.name,
            kind = %instance.template_kind,
            port = instance.port,
            "Instance created"
        );
        self.table.insert(instance);
        self.events.emit(FleetEvent::InstanceCreated {
            id: id.clone(),
            port: admission.port,
            granted: admission.granted,
        });
        self.persist().await;

        self.sync_grants(&admission.reclaimed).await;
        Ok(id)
    }

    pub async fn start(&self, id: &InstanceId) -> OrchestratorResult<()> {
        self.traced("start", id, async {
            self.table.require(id)?;
            let _guard = self.guards.try_acquire(id)?;
            self.start_locked(id).await
        })
        .await
    }

    /// Stopping an already stopped or failed instance is a no-op
    pub async fn stop(&self, id: &InstanceId) -> OrchestratorResult<()> {
        self.traced("stop", id, async {
            self.table.require(id)?;
            let _guard = self.guards.try_acquire(id)?;
            self.timers.cancel(id).await;
            self.stop_locked(id).await
        })
        .await
    }

    pub async fn restart(&self, id: &InstanceId) -> OrchestratorResult<()> {
        self.traced("restart", id, async {
            self.table.require(id)?;
            let _guard = self.guards.try_acquire(id)?;
            if matches!(self.table.status(id), Some(Running | Degraded | Recovering)) {
                // A hot host must not cost the instance its process or its recovery
                self.admission.check_thermal().await?;
                self.timers.cancel(id).await;
                self.stop_locked(id).await?;
            }
            self.start_locked(id).await
        })
        .await
    }

    pub async fn delete(&self, id: &InstanceId) -> OrchestratorResult<()> {
        self.traced("delete", id, self.delete_inner(id)).await
    }

    /// Force-stop if needed, let the template clean up, then forget the instance
    async fn delete_inner(&self, id: &InstanceId) -> OrchestratorResult<()> {
        self.table.require(id)?;
        let guard = self.guards.try_acquire(id)?;
        self.timers.cancel(id).await;

        if matches!(self.table.status(id), Some(Running | Degraded | Recovering)) {
            if let Err(e) = self.stop_locked(id).await {
                warn!(instance_id = %id, error = %e, "Force-stop reported an error, deleting anyway");
            }
        }

        let instance = self.table.require(id)?;
        if instance.deployed {
            match self.templates.get(&instance.template_kind) {
                Ok(template) => {
                    let ctx = self.context(&instance);
                    let log_location = template.log_location(&ctx);
                    if let Err(e) = self
                        .call_template(TemplateOp::Delete, id, log_location, template.delete(&ctx))
                        .await
                    {
                        error!(instance_id = %id, error = %e, "Template delete failed");
                        let record = self.error_record(&e);
                        self.table
                            .update(id, self.clock.now_ms(), |i| i.last_error = Some(record))?;
                        self.persist().await;
                        return Err(e);
                    }
                }
                Err(e) => warn!(instance_id = %id, error = %e, "Skipping template cleanup"),
            }
        }

        self.transition(id, Deleted, |i| {
            i.pid = None;
            i.granted = Budget::ZERO;
        })
        .await?;
        self.admission.ledger().credit(id);
        self.admission.ports().release(instance.port, id);
        self.handles.remove(id);
        self.table.remove(id);
        self.persist().await;

        info!(instance_id = %id, port = instance.port, "Instance deleted");
        self.events.emit(FleetEvent::InstanceDeleted { id: id.clone() });
        drop(guard);
        self.guards.remove(id);
        Ok(())
    }

    pub fn get_status(&self, id: &InstanceId) -> OrchestratorResult<InstanceStatusReport> {
        Ok(self.table.require(id)?.status_report())
    }

    pub fn list(&self) -> Vec<InstanceSummary> {
        self.table
            .snapshot()
            .iter()
            .map(ServiceInstance::summary)
            .collect()
    }

    // =========================================================================
    // Lifecycle internals (caller holds the guard)
    // =========================================================================

    async fn start_locked(&self, id: &InstanceId) -> OrchestratorResult<()> {
        let instance = self.table.require(id)?;
        match instance.status {
            Running => {
                debug!(instance_id = %id, "Already running");
                return Ok(());
            }
            Created if self.admission.ledger().holds(id) => {
                // The grant was debited at creation
                self.admission.check_thermal().await?;
            }
            Created | Stopped | Failed => {
                let (granted, reclaimed) = self
                    .admission
                    .readmit(id, instance.priority, instance.requested)
                    .await?;
                self.table.update(id, self.clock.now_ms(), |i| {
                    i.granted = granted;
                    i.recovery_state.reset();
                })?;
                self.sync_grants(&reclaimed).await;
            }
            other => return Err(invalid(id, other, Allocating)),
        }
        // Admitted: a manual start supersedes any cooldown retry
        self.timers.cancel(id).await;
        self.launch(id).await
    }

    /// Allocating -> Deploying -> (deploy) -> start -> verify -> Running
    async fn launch(&self, id: &InstanceId) -> OrchestratorResult<()> {
        self.transition(id, Allocating, |i| {
            i.deployment_stage = DeploymentStage::Allocating;
            i.health_history.reset_failures();
        })
        .await?;
        self.transition(id, Deploying, |i| {
            i.deployment_stage = DeploymentStage::Deploying
        })
        .await?;

        let instance = self.table.require(id)?;
        let template = match self.templates.get(&instance.template_kind) {
            Ok(template) => template,
            Err(e) => return self.fail_launch(id, e).await,
        };
        let ctx = self.context(&instance);
        let log_location = template.log_location(&ctx);

        if !instance.deployed {
            info!(instance_id = %id, kind = %instance.template_kind, "Deploying");
            if let Err(e) = self
                .call_template(TemplateOp::Deploy, id, log_location.clone(), template.deploy(&ctx))
                .await
            {
                return self.fail_launch(id, e).await;
            }
            self.table
                .update(id, self.clock.now_ms(), |i| i.deployed = true)?;
        }

        if let Err(e) = self.start_process(id, template.as_ref(), &ctx).await {
            return self.fail_launch(id, e).await;
        }

        if let Err(reason) = self.verify(id, template.as_ref(), &ctx).await {
            let err = OrchestratorError::StartError {
                id: id.clone(),
                reason: format!("health verification failed: {}", reason),
                log_location,
            };
            let instance = self.table.require(id)?;
            if let Err(e) = self.stop_process(&instance).await {
                warn!(instance_id = %id, error = %e, "Stop after failed verification failed");
            }
            return self.fail_launch(id, err).await;
        }

        self.transition(id, Running, |i| {
            i.deployment_stage = DeploymentStage::Completed;
            i.health_history.reset_failures();
            i.last_error = None;
        })
        .await?;
        Ok(())
    }

    async fn fail_launch(&self, id: &InstanceId, err: OrchestratorError) -> OrchestratorResult<()> {
        error!(instance_id = %id, error = %err, "Launch failed");
        if let Some((_, mut handle)) = self.handles.remove(id) {
            if let Err(e) = handle.terminate(Duration::ZERO).await {
                warn!(instance_id = %id, error = %e, "Could not kill leftover process");
            }
        }
        self.settle_terminal(id, Failed, Some(&err), |i| {
            i.deployment_stage = DeploymentStage::Failed
        })
        .await?;
        Err(err)
    }

    async fn stop_locked(&self, id: &InstanceId) -> OrchestratorResult<()> {
        let instance = self.table.require(id)?;
        match instance.status {
            Stopped | Failed => {
                debug!(instance_id = %id, status = %instance.status, "Already stopped");
                return Ok(());
            }
            Running | Degraded | Recovering => {}
            other => return Err(invalid(id, other, Stopping)),
        }

        self.transition(id, Stopping, |_| {}).await?;
        match self.stop_process(&instance).await {
            Ok(()) => self.settle_terminal(id, Stopped, None, |_| {}).await,
            Err(e @ OrchestratorError::Timeout { .. }) => {
                self.settle_terminal(id, Failed, Some(&e), |_| {}).await?;
                Err(e)
            }
            Err(e) => {
                self.settle_terminal(id, Stopped, Some(&e), |_| {}).await?;
                Err(e)
            }
        }
    }

    /// Move into a budget-free state and credit the ledger
    async fn settle_terminal(
        &self,
        id: &InstanceId,
        to: InstanceStatus,
        err: Option<&OrchestratorError>,
        extra: impl FnOnce(&mut ServiceInstance),
    ) -> OrchestratorResult<()> {
        let record = err.map(|e| self.error_record(e));
        self.transition(id, to, |i| {
            i.pid = None;
            i.granted = Budget::ZERO;
            if record.is_some() {
                i.last_error = record;
            }
            extra(i);
        })
        .await?;
        self.handles.remove(id);
        if let Some(released) = self.admission.ledger().credit(id) {
            debug!(instance_id = %id, released = %released, "Budget returned");
        }
        Ok(())
    }

    async fn start_process(
        &self,
        id: &InstanceId,
        template: &dyn ServiceTemplate,
        ctx: &TemplateContext,
    ) -> OrchestratorResult<()> {
        let handle = self
            .call_template(
                TemplateOp::Start,
                id,
                template.log_location(ctx),
                template.start(ctx),
            )
            .await?;
        let pid = handle.pid();
        self.handles.insert(id.clone(), handle);
        self.table.update(id, self.clock.now_ms(), |i| {
            i.pid = pid;
            i.deployment_stage = DeploymentStage::Verifying;
        })?;
        self.persist().await;
        Ok(())
    }

    /// Template stop; a process that survives a failed stop is killed
    async fn stop_process(&self, instance: &ServiceInstance) -> OrchestratorResult<()> {
        let mut handle = self.take_handle(instance);
        let result = match self.templates.get(&instance.template_kind) {
            Ok(template) => {
                let ctx = self.context(instance);
                let log_location = template.log_location(&ctx);
                self.call_template(
                    TemplateOp::Stop,
                    &instance.id,
                    log_location,
                    template.stop(&ctx, &mut handle),
                )
                .await
            }
            Err(e) => Err(e),
        };
        if result.is_err() && handle.is_alive() {
            warn!(instance_id = %instance.id, pid = ?handle.pid(), "Stop failed, killing process");
            if let Err(e) = handle.terminate(Duration::ZERO).await {
                error!(instance_id = %instance.id, error = %e, "Kill failed");
            }
        }
        result
    }

    /// First probes after a start; healthy once is enough
    async fn verify(
        &self,
        id: &InstanceId,
        template: &dyn ServiceTemplate,
        ctx: &TemplateContext,
    ) -> Result<(), String> {
        let instance = self.table.require(id).map_err(|e| e.to_string())?;
        let target = self.target_for(&instance, template, ctx);
        let mut last = String::from("no probe ran");
        for attempt in 1..=STARTUP_PROBE_ATTEMPTS {
            let outcome =
                probe_within(self.prober.as_ref(), &target, self.health.probe_timeout).await;
            let healthy = outcome.is_healthy();
            last = outcome.to_string();
            if let Err(e) = self.record_probe(id, outcome) {
                debug!(instance_id = %id, error = %e, "Startup probe not recorded");
            }
            if healthy {
                return Ok(());
            }
            if attempt < STARTUP_PROBE_ATTEMPTS {
                tokio::time::sleep(STARTUP_PROBE_INTERVAL).await;
            }
        }
        Err(last)
    }

    // =========================================================================
    // Health and recovery hooks
    // =========================================================================

    /// What the health monitor should probe for `id`
    pub fn probe_target(&self, id: &InstanceId) -> OrchestratorResult<ProbeTarget> {
        let instance = self.table.require(id)?;
        let template = self.templates.get(&instance.template_kind)?;
        let ctx = self.context(&instance);
        Ok(self.target_for(&instance, template.as_ref(), &ctx))
    }

    /// Append a probe outcome; returns the consecutive-failure count
    pub(crate) fn record_probe(&self, id: &InstanceId, outcome: ProbeOutcome) -> OrchestratorResult<u32> {
        let now = self.clock.now_ms();
        let failures = self
            .table
            .update(id, now, |i| i.health_history.push(now, outcome.clone()))?;
        self.events.emit(FleetEvent::ProbeCompleted {
            id: id.clone(),
            outcome,
            consecutive_failures: failures,
        });
        Ok(failures)
    }

    /// Running -> Degraded. False when busy or no longer running.
    pub(crate) async fn mark_degraded(&self, id: &InstanceId) -> OrchestratorResult<bool> {
        let Ok(_guard) = self.guards.try_acquire(id) else {
            return Ok(false);
        };
        if self.table.status(id) != Some(Running) {
            return Ok(false);
        }
        self.transition(id, Degraded, |_| {}).await?;
        warn!(instance_id = %id, "Instance degraded");
        Ok(true)
    }

    /// Degraded -> Recovering. True when the instance is (now) recovering.
    pub(crate) async fn begin_recovery(&self, id: &InstanceId) -> OrchestratorResult<bool> {
        let _guard = self.guards.acquire(id).await;
        match self.table.require(id)?.status {
            Degraded => {
                self.transition(id, Recovering, |_| {}).await?;
                Ok(true)
            }
            Recovering => Ok(true),
            _ => Ok(false),
        }
    }

    /// One stop-then-start attempt. True when the instance is Running again.
    pub(crate) async fn recovery_attempt(&self, id: &InstanceId) -> OrchestratorResult<bool> {
        let _guard = self.guards.acquire(id).await;
        let instance = self.table.require(id)?;
        if instance.status != Recovering {
            return Err(invalid(id, instance.status, Running));
        }

        let now = self.clock.now_ms();
        let attempt = self.table.update(id, now, |i| {
            i.recovery_state.attempt_count += 1;
            i.recovery_state.last_attempt_at = Some(now);
            i.recovery_state.attempt_count
        })?;
        self.persist().await;
        info!(instance_id = %id, attempt, "Recovery attempt");

        let result = self.relaunch(&instance).await;
        self.events.emit(FleetEvent::RecoveryAttempted {
            id: id.clone(),
            attempt,
            success: result.is_ok(),
        });

        match result {
            Ok(()) => {
                self.transition(id, Running, |i| {
                    i.recovery_state.reset();
                    i.health_history.reset_failures();
                    i.deployment_stage = DeploymentStage::Completed;
                    i.last_error = None;
                })
                .await?;
                info!(instance_id = %id, attempt, "Instance recovered");
                Ok(true)
            }
            Err(e) => {
                warn!(instance_id = %id, attempt, error = %e, "Recovery attempt failed");
                let record = self.error_record(&e);
                self.table
                    .update(id, self.clock.now_ms(), |i| i.last_error = Some(record))?;
                self.persist().await;
                Ok(false)
            }
        }
    }

    async fn relaunch(&self, instance: &ServiceInstance) -> OrchestratorResult<()> {
        let id = &instance.id;
        if let Err(e) = self.stop_process(instance).await {
            debug!(instance_id = %id, error = %e, "Stop before restart failed");
        }
        self.table.update(id, self.clock.now_ms(), |i| i.pid = None)?;

        let template = self.templates.get(&instance.template_kind)?;
        let ctx = self.context(instance);
        self.start_process(id, template.as_ref(), &ctx).await?;

        if let Err(reason) = self.verify(id, template.as_ref(), &ctx).await {
            let current = self.table.require(id)?;
            if let Err(e) = self.stop_process(&current).await {
                debug!(instance_id = %id, error = %e, "Stop after failed verification failed");
            }
            self.table.update(id, self.clock.now_ms(), |i| i.pid = None)?;
            return Err(OrchestratorError::StartError {
                id: id.clone(),
                reason: format!("health verification failed: {}", reason),
                log_location: template.log_location(&ctx),
            });
        }
        Ok(())
    }

    /// Recovering -> Failed once attempts are exhausted
    pub(crate) async fn fail_recovery(
        &self,
        id: &InstanceId,
        cooldown_until: TimestampMs,
    ) -> OrchestratorResult<()> {
        let _guard = self.guards.acquire(id).await;
        let instance = self.table.require(id)?;
        if instance.status != Recovering {
            return Ok(());
        }
        if let Err(e) = self.stop_process(&instance).await {
            warn!(instance_id = %id, error = %e, "Stop on recovery exhaustion failed");
        }
        let err = OrchestratorError::StartError {
            id: id.clone(),
            reason: format!(
                "recovery exhausted after {} attempts",
                instance.recovery_state.attempt_count
            ),
            log_location: instance
                .last_error
                .as_ref()
                .and_then(|e| e.log_location.clone()),
        };
        self.settle_terminal(id, Failed, Some(&err), |i| {
            i.recovery_state.cooldown_until = Some(cooldown_until)
        })
        .await?;
        error!(instance_id = %id, cooldown_until, "Recovery exhausted");
        Ok(())
    }

    /// Put a failed instance back on the cooldown path. False unless it is
    /// `Failed` with no cooldown pending.
    pub(crate) async fn arm_cooldown(
        &self,
        id: &InstanceId,
        cooldown_until: TimestampMs,
    ) -> OrchestratorResult<bool> {
        let _guard = self.guards.acquire(id).await;
        let instance = self.table.require(id)?;
        if instance.status != Failed || instance.recovery_state.cooldown_until.is_some() {
            return Ok(false);
        }
        self.table.update(id, self.clock.now_ms(), |i| {
            i.recovery_state.cooldown_until = Some(cooldown_until)
        })?;
        self.persist().await;
        Ok(true)
    }

    /// Failed -> Recovering with a fresh attempt budget, once the cooldown is over.
    /// False when the instance is not waiting out a cooldown.
    pub(crate) async fn restart_recovery_cycle(&self, id: &InstanceId) -> OrchestratorResult<bool> {
        let _guard = self.guards.acquire(id).await;
        let instance = self.table.require(id)?;
        let now = self.clock.now_ms();
        match (instance.status, instance.recovery_state.cooldown_until) {
            (Failed, Some(until)) if until <= now => {}
            _ => return Ok(false),
        }

        let (granted, reclaimed) = self
            .admission
            .readmit(id, instance.priority, instance.requested)
            .await?;
        self.transition(id, Recovering, |i| {
            i.granted = granted;
            i.recovery_state.reset();
        })
        .await?;
        info!(instance_id = %id, "Cooldown elapsed, starting a fresh recovery cycle");
        self.sync_grants(&reclaimed).await;
        Ok(true)
    }

    // =========================================================================
    // Directives and budgets
    // =========================================================================

    /// Deliver an advisory directive. False when the instance is busy or not running.
    pub async fn apply_directive(
        &self,
        id: &InstanceId,
        directive: &Directive,
    ) -> OrchestratorResult<bool> {
        let instance = self.table.require(id)?;
        let Ok(_guard) = self.guards.try_acquire(id) else {
            debug!(instance_id = %id, directive = %directive, "Instance busy, directive skipped");
            return Ok(false);
        };
        if !matches!(self.table.status(id), Some(Running | Degraded)) {
            return Ok(false);
        }

        let template = self.templates.get(&instance.template_kind)?;
        let ctx = self.context(&instance);
        let handle = self.take_handle(&instance);
        let result = self
            .call_template(
                TemplateOp::Directive,
                id,
                None,
                template.apply_directive(&ctx, &handle, directive),
            )
            .await;
        self.handles.insert(id.clone(), handle);
        result?;
        debug!(instance_id = %id, directive = %directive, "Directive delivered");
        Ok(true)
    }

    /// Commit new grants to the ledger, then mirror them on the instances
    pub async fn apply_budget_changes(&self, changes: &[BudgetChange]) -> OrchestratorResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.admission.ledger().apply_changes(changes)?;
        self.sync_grants(changes).await;
        Ok(())
    }

    /// Mirror ledger grants onto instances and tell running ones about it
    async fn sync_grants(&self, changes: &[BudgetChange]) {
        if changes.is_empty() {
            return;
        }
        let ledger = self.admission.ledger();
        for change in changes {
            let synced = self.table.update(&change.id, self.clock.now_ms(), |i| {
                if !i.status.holds_budget() {
                    return None;
                }
                let granted = ledger.granted(&i.id)?;
                i.granted = granted;
                Some((granted, i.status))
            });
            let Ok(Some((granted, status))) = synced else {
                continue;
            };
            info!(instance_id = %change.id, from = %change.from, to = %granted, "Budget changed");
            self.events.emit(FleetEvent::BudgetChanged {
                id: change.id.clone(),
                from: change.from,
                to: granted,
            });
            if matches!(status, Running | Degraded) {
                let directive = Directive::ApplyBudget { budget: granted };
                if let Err(e) = self.apply_directive(&change.id, &directive).await {
                    warn!(instance_id = %change.id, error = %e, "Budget directive failed");
                }
            }
        }
        self.persist().await;
    }

    // =========================================================================
    // Restore
    // =========================================================================

    /// Re-enter a persisted instance, settling interrupted transitions
    pub(crate) fn restore_instance(&self, mut instance: ServiceInstance) -> OrchestratorResult<Resume> {
        let id = instance.id.clone();
        let now = self.clock.now_ms();

        let settled = match instance.status {
            Allocating | Deploying => Some(Failed),
            Stopping => Some(Stopped),
            _ => None,
        };
        if let Some(to) = settled {
            validate_transition(&id, instance.status, to)?;
            warn!(instance_id = %id, from = %instance.status, to = %to, "Settling interrupted transition");
            kill_adopted(&id, instance.pid.take());
            instance.status = to;
            instance.granted = Budget::ZERO;
            if to == Failed {
                instance.deployment_stage = DeploymentStage::Failed;
            }
            instance.updated_at = now;
        }

        self.admission.ports().reserve(&id, Some(instance.port))?;

        if instance.status.holds_budget() {
            if let Err(e) = self.admission.ledger().restore(
                &id,
                instance.priority,
                instance.requested,
                instance.granted,
            ) {
                error!(instance_id = %id, error = %e, "Restored grant no longer fits");
                instance.granted = Budget::ZERO;
                instance.last_error = Some(self.error_record(&e));
                if instance.status != Created {
                    // Running | Degraded | Recovering -> Stopping -> Stopped
                    validate_transition(&id, instance.status, Stopping)?;
                    kill_adopted(&id, instance.pid.take());
                    instance.status = Stopped;
                }
            }
        }

        if instance.status.may_have_process() {
            if let Some(pid) = instance.pid {
                self.handles
                    .insert(id.clone(), ProcessHandle::adopted(Some(pid), now));
            }
        }

        let resume = match instance.status {
            Running => Resume::Monitor,
            Degraded | Recovering => Resume::Recover,
            Failed if instance.recovery_state.cooldown_until.is_some() => Resume::Recover,
            _ => Resume::Nothing,
        };
        info!(instance_id = %id, status = %instance.status, pid = ?instance.pid, "Instance restored");
        self.table.insert(instance);
        Ok(resume)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Run a user operation inside a correlated instance span
    async fn traced<F>(&self, operation: &'static str, id: &InstanceId, fut: F) -> OrchestratorResult<()>
    where
        F: Future<Output = OrchestratorResult<()>>,
    {
        let span = instance_span(operation, id);
        let result = fut.instrument(span.span().clone()).await;
        match &result {
            Ok(()) => span.record_result(true),
            Err(e) => span.record_error(&e.to_string()),
        }
        result
    }

    /// Validated status change; persisted and broadcast
    async fn transition(
        &self,
        id: &InstanceId,
        to: InstanceStatus,
        f: impl FnOnce(&mut ServiceInstance),
    ) -> OrchestratorResult<InstanceStatus> {
        let now = self.clock.now_ms();
        let from = self.table.update(id, now, |instance| {
            let from = instance.status;
            validate_transition(&instance.id, from, to)?;
            instance.status = to;
            f(instance);
            Ok::<_, OrchestratorError>(from)
        })??;
        info!(instance_id = %id, from = %from, to = %to, "Status changed");
        self.events.emit(FleetEvent::StatusChanged {
            id: id.clone(),
            from,
            to,
            at: now,
        });
        self.persist().await;
        Ok(from)
    }

    async fn call_template<T, F>(
        &self,
        op: TemplateOp,
        id: &InstanceId,
        log_location: Option<String>,
        fut: F,
    ) -> OrchestratorResult<T>
    where
        F: Future<Output = Result<T, TemplateError>>,
    {
        match guarded_call(op.name(), op.deadline(&self.timeouts), fut).await {
            GuardedOutcome::Completed(Ok(value)) => Ok(value),
            GuardedOutcome::Completed(Err(e)) => Err(op.error(id, e.to_string(), log_location)),
            GuardedOutcome::TimedOut => Err(OrchestratorError::Timeout {
                operation: op.name().to_string(),
                id: id.clone(),
            }),
            GuardedOutcome::Panicked(message) => Err(op.error(
                id,
                format!("template panicked: {}", message),
                log_location,
            )),
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.store.persist(&self.table).await {
            warn!(error = %e, "State persist failed");
        }
    }

    fn take_handle(&self, instance: &ServiceInstance) -> ProcessHandle {
        self.handles
            .remove(&instance.id)
            .map(|(_, handle)| handle)
            .unwrap_or_else(|| ProcessHandle::adopted(instance.pid, self.clock.now_ms()))
    }

    fn context(&self, instance: &ServiceInstance) -> TemplateContext {
        TemplateContext::from_instance(instance, &self.log_dir)
    }

    fn target_for(
        &self,
        instance: &ServiceInstance,
        template: &dyn ServiceTemplate,
        ctx: &TemplateContext,
    ) -> ProbeTarget {
        ProbeTarget {
            id: instance.id.clone(),
            port: instance.port,
            pid: instance.pid,
            spec: template.probe(ctx),
        }
    }

    fn error_record(&self, err: &OrchestratorError) -> ErrorRecord {
        ErrorRecord {
            message: err.to_string(),
            log_location: err.log_location().map(str::to_string),
            at: self.clock.now_ms(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn table(&self) -> &InstanceTable {
        &self.table
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn guards(&self) -> &OperationGuards {
        &self.guards
    }

    pub fn timers(&self) -> &RecoveryTimers {
        &self.timers
    }

    pub fn health_config(&self) -> &HealthConfig {
        &self.health
    }

    /// Pid of the live handle, if the supervisor holds one
    pub fn handle_pid(&self, id: &InstanceId) -> Option<u32> {
        self.handles.get(id).and_then(|h| h.pid())
    }
}

fn kill_adopted(id: &InstanceId, pid: Option<u32>) {
    let Some(pid) = pid else { return };
    match ProcessHandle::adopted(Some(pid), 0).signal(Signal::SIGKILL) {
        Ok(()) => warn!(instance_id = %id, pid, "Killed process left from an interrupted transition"),
        Err(e) => debug!(instance_id = %id, pid, error = %e, "Leftover process already gone"),
    }
}

fn invalid(id: &InstanceId, from: InstanceStatus, to: InstanceStatus) -> OrchestratorError {
    OrchestratorError::InvalidTransition {
        id: id.clone(),
        from: from.to_string(),
        to: to.to_string(),
    }
}
