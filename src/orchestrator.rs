/*!
 * Orchestrator
 *
 * Explicit context that wires the ledger, state store, supervisor and the
 * background loops together. Everything is built once by
 * `OrchestratorBuilder`; samplers, prober and clock can be swapped for fakes.
 *
 * Lifecycle of the context itself:
 * 1. `build()` validates the configuration and constructs every component
 * 2. `restore()` re-enters persisted instances and resumes recovery
 * 3. `start_background()` spawns health, optimization, autosave, maintenance
 * 4. `shutdown()` stops the loops and flushes state; service processes keep running
 */

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::OrchestratorConfig;
use crate::core::errors::OrchestratorResult;
use crate::core::limits::{EVENT_CHANNEL_CAPACITY, PROCESS_STOP_GRACE};
use crate::core::periodic::PeriodicTask;
use crate::core::types::{InstanceId, TimestampMs};
use crate::events::{EventBus, FleetEvent};
use crate::health::{HealthMonitor, NetworkProber, Prober};
use crate::instance::{InstanceSpec, InstanceStatus, InstanceStatusReport, InstanceSummary, InstanceTable};
use crate::maintenance::MaintenanceScheduler;
use crate::monitoring::{LoadSampler, ProcLoadSampler, SysfsThermalSampler, ThermalSampler};
use crate::optimization::{ActionClass, OptimizationEngine, TriggerStatus};
use crate::process::{ProcessSupervisor, Resume, SupervisorDeps};
use crate::recovery::RecoveryCoordinator;
use crate::resources::{AdmissionController, LedgerSnapshot, PortRegistry, ResourceLedger};
use crate::storage::{AutosaveJob, StateStore};
use crate::template::{CommandTemplate, ServiceTemplate, TemplateRegistry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Builder for `Orchestrator`
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    templates: Vec<Arc<dyn ServiceTemplate>>,
    command_template: bool,
    prober: Option<Arc<dyn Prober>>,
    load: Option<Arc<dyn LoadSampler>>,
    thermal: Option<Arc<dyn ThermalSampler>>,
    clock: Option<Arc<dyn Clock>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            templates: Vec::new(),
            command_template: true,
            prober: None,
            load: None,
            thermal: None,
            clock: None,
        }
    }

    /// Register a template collaborator
    pub fn with_template(mut self, template: Arc<dyn ServiceTemplate>) -> Self {
        self.templates.push(template);
        self
    }

    /// Leave out the built-in `command` template
    pub fn without_command_template(mut self) -> Self {
        self.command_template = false;
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn with_load_sampler(mut self, load: Arc<dyn LoadSampler>) -> Self {
        self.load = Some(load);
        self
    }

    pub fn with_thermal_sampler(mut self, thermal: Arc<dyn ThermalSampler>) -> Self {
        self.thermal = Some(thermal);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> OrchestratorResult<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let thermal: Arc<dyn ThermalSampler> = self
            .thermal
            .unwrap_or_else(|| Arc::new(SysfsThermalSampler::new(config.thermal.zone_root.clone())));
        let load: Arc<dyn LoadSampler> = self.load.unwrap_or_else(|| Arc::new(ProcLoadSampler::new()));
        let prober: Arc<dyn Prober> = self.prober.unwrap_or_else(|| Arc::new(NetworkProber::new()));
        let events = EventBus::new(EVENT_CHANNEL_CAPACITY);

        let capacity = config.capacity.resolve();
        let ledger = Arc::new(ResourceLedger::new(
            capacity,
            config.admission.safety_margin,
            config.admission.min_grant_fraction,
        ));
        let ports = Arc::new(PortRegistry::new(
            config.admission.port_range_start..=config.admission.port_range_end,
            config.admission.skip_os_bound_ports,
        ));
        let admission = Arc::new(AdmissionController::new(
            ledger,
            ports,
            thermal.clone(),
            config.thermal.clone(),
        ));
        let store = Arc::new(StateStore::new(config.storage.state_path.clone(), clock.clone()));

        let templates = TemplateRegistry::new();
        if self.command_template {
            templates.register(Arc::new(CommandTemplate::new(PROCESS_STOP_GRACE)));
        }
        for template in self.templates {
            templates.register(template);
        }

        let supervisor = Arc::new(ProcessSupervisor::new(
            SupervisorDeps {
                table: InstanceTable::new(),
                templates,
                admission: admission.clone(),
                store,
                events: events.clone(),
                clock: clock.clone(),
                prober: prober.clone(),
            },
            config.health.clone(),
            config.timeouts.clone(),
            config.storage.log_dir.clone(),
        ));
        let recovery = Arc::new(RecoveryCoordinator::new(supervisor.clone(), &config.recovery));
        let health = Arc::new(HealthMonitor::new(
            supervisor.clone(),
            recovery.clone(),
            prober,
            config.health.clone(),
        ));
        let optimization = Arc::new(OptimizationEngine::new(
            supervisor.clone(),
            load,
            thermal.clone(),
            config.optimization.clone(),
            &config.thermal,
            config.admission.priority_weights,
        ));
        let maintenance = Arc::new(MaintenanceScheduler::new(
            &config.maintenance,
            admission,
            events,
            clock,
        ));

        info!(
            capacity = %capacity,
            safety_margin = config.admission.safety_margin,
            state_path = %config.storage.state_path.display(),
            "Orchestrator initialized"
        );

        Ok(Orchestrator {
            config,
            supervisor,
            recovery,
            health,
            optimization,
            maintenance,
            thermal,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Temperature part of the system snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThermalView {
    pub celsius: Option<f64>,
    pub smoothed_celsius: Option<f64>,
    pub unsafe_to_start_celsius: f64,
    pub safe_to_start: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkView {
    #[serde(rename = "rxKBps")]
    pub rx_kbps: Option<f64>,
    #[serde(rename = "txKBps")]
    pub tx_kbps: Option<f64>,
    #[serde(rename = "capacityKbps")]
    pub capacity_kbps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadView {
    pub cpu_ema: Option<f64>,
    pub memory_ema: Option<f64>,
    /// Orchestrator's own CPU share, already excluded from `cpu_ema`
    pub self_cpu_percent: Option<f64>,
    pub sampled_at: Option<TimestampMs>,
}

/// Answer to `getSystemSnapshot`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub ledger: LedgerSnapshot,
    pub thermal: ThermalView,
    pub network: NetworkView,
    pub load: LoadView,
    pub instances: BTreeMap<InstanceStatus, usize>,
    pub triggers: BTreeMap<ActionClass, TriggerStatus>,
    pub throttled: Vec<InstanceId>,
    pub taken_at: TimestampMs,
}

/// What `restore` did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    pub restored: usize,
    /// Running instances handed back to health monitoring
    pub monitored: Vec<InstanceId>,
    pub recovering: Vec<InstanceId>,
    pub skipped: Vec<InstanceId>,
    pub maintenance_tasks: usize,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    supervisor: Arc<ProcessSupervisor>,
    recovery: Arc<RecoveryCoordinator>,
    health: Arc<HealthMonitor>,
    optimization: Arc<OptimizationEngine>,
    maintenance: Arc<MaintenanceScheduler>,
    thermal: Arc<dyn ThermalSampler>,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    // =========================================================================
    // Inbound operations
    // =========================================================================

    pub async fn create_instance(&self, spec: InstanceSpec) -> OrchestratorResult<InstanceId> {
        self.supervisor.create(spec).await
    }

    pub async fn start(&self, id: &InstanceId) -> OrchestratorResult<()> {
        let episode = self.in_recovery_episode(id);
        let result = self.supervisor.start(id).await;
        self.settle_manual_attempt(id, episode, &result).await;
        result
    }

    pub async fn stop(&self, id: &InstanceId) -> OrchestratorResult<()> {
        self.supervisor.stop(id).await
    }

    pub async fn restart(&self, id: &InstanceId) -> OrchestratorResult<()> {
        let episode = self.in_recovery_episode(id);
        let result = self.supervisor.restart(id).await;
        self.settle_manual_attempt(id, episode, &result).await;
        result
    }

    /// Degraded, recovering, or failed and waiting out a cooldown
    fn in_recovery_episode(&self, id: &InstanceId) -> bool {
        self.supervisor.table().get(id).is_some_and(|i| match i.status {
            InstanceStatus::Degraded | InstanceStatus::Recovering => true,
            InstanceStatus::Failed => i.recovery_state.cooldown_until.is_some(),
            _ => false,
        })
    }

    /// A manual start that failed during recovery must not end the episode
    async fn settle_manual_attempt(
        &self,
        id: &InstanceId,
        episode: bool,
        result: &OrchestratorResult<()>,
    ) {
        let failed = self.supervisor.table().status(id) == Some(InstanceStatus::Failed);
        if episode && result.is_err() && failed {
            self.recovery.requeue(id).await;
        }
    }

    pub async fn delete(&self, id: &InstanceId) -> OrchestratorResult<()> {
        self.supervisor.delete(id).await
    }

    pub fn get_status(&self, id: &InstanceId) -> OrchestratorResult<InstanceStatusReport> {
        self.supervisor.get_status(id)
    }

    pub fn list_instances(&self) -> Vec<InstanceSummary> {
        self.supervisor.list()
    }

    pub async fn system_snapshot(&self) -> SystemSnapshot {
        let celsius = self.thermal.read_celsius().await;
        let status = self.optimization.status();
        let load = status.load;
        let limit = self.config.thermal.unsafe_to_start_celsius;
        let safe_to_start = match celsius {
            Some(c) => c < limit,
            None => !self.config.thermal.reject_on_unknown,
        };
        let sample = load.sample;

        SystemSnapshot {
            ledger: self.supervisor.admission().ledger().snapshot(),
            thermal: ThermalView {
                celsius,
                smoothed_celsius: load.temperature_ema,
                unsafe_to_start_celsius: limit,
                safe_to_start,
            },
            network: NetworkView {
                rx_kbps: sample.map(|s| s.network_rx_kbps),
                tx_kbps: sample.map(|s| s.network_tx_kbps),
                capacity_kbps: self.supervisor.admission().ledger().capacity().bandwidth_kbps,
            },
            load: LoadView {
                cpu_ema: load.cpu_ema,
                memory_ema: load.memory_ema,
                self_cpu_percent: sample.map(|s| s.self_cpu_percent),
                sampled_at: load.sampled_at,
            },
            instances: self.supervisor.table().count_by_status(),
            triggers: status.triggers,
            throttled: status.throttled,
            taken_at: self.supervisor.clock().now_ms(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.supervisor.events().subscribe()
    }

    // =========================================================================
    // Startup and shutdown
    // =========================================================================

    /// Re-enter persisted instances and resume interrupted recovery.
    /// Call once, before any instance is created.
    pub async fn restore(&self) -> OrchestratorResult<RestoreReport> {
        let mut report = RestoreReport::default();
        let instances = self.supervisor.store().load().await?;

        for instance in instances {
            let id = instance.id.clone();
            if self.supervisor.table().contains(&id) {
                warn!(instance_id = %id, "Instance already present, not restored");
                report.skipped.push(id);
                continue;
            }
            match self.supervisor.restore_instance(instance) {
                Ok(resume) => {
                    report.restored += 1;
                    match resume {
                        Resume::Nothing => {}
                        Resume::Monitor => report.monitored.push(id),
                        Resume::Recover => {
                            self.recovery.schedule(id.clone());
                            report.recovering.push(id);
                        }
                    }
                }
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "Instance could not be restored");
                    report.skipped.push(id);
                }
            }
        }
        self.supervisor
            .store()
            .flush(self.supervisor.table())
            .await?;

        if self.config.maintenance.enabled {
            report.maintenance_tasks = self.maintenance.load().await?;
        }

        info!(
            restored = report.restored,
            monitored = report.monitored.len(),
            recovering = report.recovering.len(),
            skipped = report.skipped.len(),
            "State restored"
        );
        Ok(report)
    }

    /// Spawn the periodic loops; calling again is a no-op
    pub fn start_background(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(PeriodicTask::spawn(
            self.health.clone(),
            self.config.health.interval,
        ));
        tasks.push(PeriodicTask::spawn(
            self.optimization.clone(),
            self.config.optimization.sample_interval,
        ));
        tasks.push(PeriodicTask::spawn(
            Arc::new(AutosaveJob::new(
                self.supervisor.store().clone(),
                self.supervisor.table().clone(),
            )),
            self.config.storage.autosave_interval,
        ));
        if self.config.maintenance.enabled {
            tasks.push(PeriodicTask::spawn(
                self.maintenance.clone(),
                self.config.maintenance.tick,
            ));
        }
        info!(tasks = tasks.len(), "Background loops started");
    }

    /// Stop the loops, cancel pending recovery and write final state.
    /// Service processes are left running and are adopted on the next restore.
    pub async fn shutdown(&self) -> OrchestratorResult<()> {
        let tasks: Vec<PeriodicTask> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.shutdown().await;
        }
        self.supervisor.timers().cancel_all().await;
        self.supervisor
            .store()
            .flush(self.supervisor.table())
            .await?;
        info!(instances = self.supervisor.table().len(), "Orchestrator shut down");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn recovery(&self) -> &Arc<RecoveryCoordinator> {
        &self.recovery
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn optimization(&self) -> &Arc<OptimizationEngine> {
        &self.optimization
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceScheduler> {
        &self.maintenance
    }
}
