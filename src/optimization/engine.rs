/*!
 * Optimization Loop
 *
 * Samples host load, smooths it, and turns sustained pressure into advisory
 * directives and budget rebalancing. Every action class is gated by a
 * deadband and a re-arm interval, and the sampled CPU figure excludes the
 * orchestrator's own usage, so observing the host cannot by itself trigger a
 * correction. Directives and budget changes go through the supervisor under
 * the per-instance guard; this loop never writes instance state.
 */

use super::directives::{ActionClass, Directive, IssuedDirective};
use super::hysteresis::{HysteresisTrigger, RearmGate, TriggerEvent, TriggerStatus};
use crate::core::config::{Deadband, OptimizationConfig, PriorityWeights, ThermalConfig};
use crate::core::periodic::PeriodicJob;
use crate::core::types::{InstanceId, Priority, TimestampMs};
use crate::events::FleetEvent;
use crate::instance::{InstanceStatus, ServiceInstance};
use crate::monitoring::{Ema, LoadSample, LoadSampler, ThermalSampler};
use crate::process::ProcessSupervisor;
use crate::resources::{plan_rebalance, BudgetChange};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Latest smoothed view of the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub sample: Option<LoadSample>,
    pub cpu_ema: Option<f64>,
    pub memory_ema: Option<f64>,
    pub temperature_celsius: Option<f64>,
    pub temperature_ema: Option<f64>,
    pub sampled_at: Option<TimestampMs>,
}

/// Snapshot of the loop for `getSystemSnapshot`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationStatus {
    pub load: LoadReport,
    pub triggers: BTreeMap<ActionClass, TriggerStatus>,
    pub throttled: Vec<InstanceId>,
}

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub fired: Vec<ActionClass>,
    pub released: Vec<ActionClass>,
    pub directives: Vec<IssuedDirective>,
    pub rebalanced: Vec<BudgetChange>,
}

struct EngineState {
    cpu: Ema,
    memory: Ema,
    temperature: Ema,
    cpu_trigger: HysteresisTrigger,
    memory_trigger: HysteresisTrigger,
    thermal_trigger: HysteresisTrigger,
    rebalance_gate: RearmGate,
    throttled: HashSet<InstanceId>,
}

pub struct OptimizationEngine {
    supervisor: Arc<ProcessSupervisor>,
    load: Arc<dyn LoadSampler>,
    thermal: Arc<dyn ThermalSampler>,
    config: OptimizationConfig,
    weights: PriorityWeights,
    state: Mutex<EngineState>,
    latest: ArcSwap<LoadReport>,
}

impl OptimizationEngine {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        load: Arc<dyn LoadSampler>,
        thermal: Arc<dyn ThermalSampler>,
        config: OptimizationConfig,
        thermal_config: &ThermalConfig,
        weights: PriorityWeights,
    ) -> Self {
        let rearm = config.rearm_interval;
        let thermal_band = Deadband::new(
            thermal_config.throttle_high_celsius,
            thermal_config.throttle_low_celsius,
        );
        let state = EngineState {
            cpu: Ema::from_window(config.ema_window),
            memory: Ema::from_window(config.ema_window),
            temperature: Ema::from_window(config.ema_window),
            cpu_trigger: HysteresisTrigger::new(config.cpu, rearm),
            memory_trigger: HysteresisTrigger::new(config.memory, rearm),
            thermal_trigger: HysteresisTrigger::new(thermal_band, rearm),
            rebalance_gate: RearmGate::new(rearm),
            throttled: HashSet::new(),
        };
        Self {
            supervisor,
            load,
            thermal,
            config,
            weights,
            state: Mutex::new(state),
            latest: ArcSwap::from_pointee(LoadReport::default()),
        }
    }

    /// Latest smoothed load; lock-free
    pub fn latest(&self) -> Arc<LoadReport> {
        self.latest.load_full()
    }

    pub fn status(&self) -> OptimizationStatus {
        let now = self.supervisor.clock().now_ms();
        let state = self.state.lock();
        let mut triggers = BTreeMap::new();
        for (class, trigger) in [
            (ActionClass::ReduceCpu, &state.cpu_trigger),
            (ActionClass::ReduceMemory, &state.memory_trigger),
            (ActionClass::Thermal, &state.thermal_trigger),
        ] {
            triggers.insert(
                class,
                TriggerStatus::of_gate(trigger.gate(), trigger.is_engaged(), now),
            );
        }
        triggers.insert(
            ActionClass::Rebalance,
            TriggerStatus::of_gate(&state.rebalance_gate, false, now),
        );
        let mut throttled: Vec<InstanceId> = state.throttled.iter().cloned().collect();
        throttled.sort();
        OptimizationStatus {
            load: (*self.latest()).clone(),
            triggers,
            throttled,
        }
    }

    /// One sample-decide-act pass
    pub async fn run_pass(&self) -> PassReport {
        let mut report = PassReport::default();
        let sample = match self.load.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Load sample failed, skipping pass");
                return report;
            }
        };
        let celsius = self.thermal.read_celsius().await;
        let now = self.supervisor.clock().now_ms();

        let events = {
            let mut state = self.state.lock();
            let cpu = state.cpu.update(sample.cpu_percent);
            let memory = state.memory.update(sample.memory_percent);
            let temperature = celsius.and_then(|c| state.temperature.update(c));

            self.latest.store(Arc::new(LoadReport {
                sample: Some(sample),
                cpu_ema: cpu,
                memory_ema: memory,
                temperature_celsius: celsius,
                temperature_ema: temperature,
                sampled_at: Some(now),
            }));

            // Only a full window of samples may drive an action
            let state = &mut *state;
            let mut events = Vec::new();
            if let Some(v) = state.cpu.settled() {
                events.push((ActionClass::ReduceCpu, state.cpu_trigger.observe(v, now)));
            }
            if let Some(v) = state.memory.settled() {
                events.push((ActionClass::ReduceMemory, state.memory_trigger.observe(v, now)));
            }
            if let Some(v) = state.temperature.settled() {
                events.push((ActionClass::Thermal, state.thermal_trigger.observe(v, now)));
            }
            events
        };

        debug!(
            cpu = sample.cpu_percent,
            self_cpu = sample.self_cpu_percent,
            memory = sample.memory_percent,
            celsius = ?celsius,
            "Load sampled"
        );

        for (class, event) in events {
            match event {
                TriggerEvent::Idle => {}
                TriggerEvent::Fire => {
                    info!(class = %class, "Corrective action fired");
                    report.fired.push(class);
                    self.act(class, &mut report).await;
                }
                TriggerEvent::Release => {
                    info!(class = %class, "Corrective action released");
                    report.released.push(class);
                    if class == ActionClass::Thermal {
                        self.release_throttling(&mut report).await;
                    }
                }
            }
        }

        self.rebalance(now, &mut report).await;
        report
    }

    async fn act(&self, class: ActionClass, report: &mut PassReport) {
        let directive = match class {
            ActionClass::ReduceCpu => Directive::ReduceWorkers {
                target_fraction: self.config.reduce_workers_fraction,
            },
            ActionClass::ReduceMemory => Directive::EvictCache,
            ActionClass::Thermal => Directive::EnableThrottling,
            ActionClass::Rebalance => return,
        };
        let targets = self.select_targets(class);
        if targets.is_empty() {
            debug!(class = %class, "No eligible targets");
            return;
        }
        for id in targets {
            if self.deliver(class, &id, directive.clone(), report).await
                && class == ActionClass::Thermal
            {
                self.state.lock().throttled.insert(id);
            }
        }
    }

    async fn release_throttling(&self, report: &mut PassReport) {
        let throttled: Vec<InstanceId> = self.state.lock().throttled.drain().collect();
        for id in throttled {
            self.deliver(ActionClass::Thermal, &id, Directive::DisableThrottling, report)
                .await;
        }
    }

    async fn deliver(
        &self,
        class: ActionClass,
        id: &InstanceId,
        directive: Directive,
        report: &mut PassReport,
    ) -> bool {
        match self.supervisor.apply_directive(id, &directive).await {
            Ok(true) => {
                info!(instance_id = %id, class = %class, directive = %directive, "Directive issued");
                self.supervisor.events().emit(FleetEvent::DirectiveIssued {
                    id: id.clone(),
                    class,
                    directive: directive.clone(),
                });
                report.directives.push(IssuedDirective {
                    instance_id: id.clone(),
                    class,
                    directive,
                });
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(instance_id = %id, class = %class, error = %e, "Directive failed");
                false
            }
        }
    }

    /// Lowest-priority running instances first, heaviest consumer first within a priority.
    /// High-priority instances are never asked to shed load.
    fn select_targets(&self, class: ActionClass) -> Vec<InstanceId> {
        let mut candidates: Vec<ServiceInstance> = self.supervisor.table().filter(|i| {
            i.status == InstanceStatus::Running && i.priority < Priority::High
        });
        let weight = |i: &ServiceInstance| match class {
            ActionClass::ReduceMemory => i.granted.memory_mb,
            _ => i.granted.cpu_percent,
        };
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| weight(b).total_cmp(&weight(a)))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
            .into_iter()
            .take(self.config.max_targets)
            .map(|i| i.id)
            .collect()
    }

    /// Move grants toward their fair shares, at most once per re-arm interval
    async fn rebalance(&self, now: TimestampMs, report: &mut PassReport) {
        if !self.state.lock().rebalance_gate.is_ready(now) {
            return;
        }
        let ledger = self.supervisor.admission().ledger();
        let changes = plan_rebalance(
            &ledger.share_entries(),
            &ledger.limit(),
            &self.weights,
            &self.config.tolerance,
        );
        if changes.is_empty() {
            return;
        }
        self.state.lock().rebalance_gate.fire(now);
        match self.supervisor.apply_budget_changes(&changes).await {
            Ok(()) => {
                info!(changes = changes.len(), "Budgets rebalanced");
                report.fired.push(ActionClass::Rebalance);
                report.rebalanced = changes;
            }
            Err(e) => warn!(error = %e, "Rebalance rejected, retrying next interval"),
        }
    }
}

#[async_trait]
impl PeriodicJob for OptimizationEngine {
    fn name(&self) -> &'static str {
        "optimization"
    }

    async fn tick(&self) {
        let report = self.run_pass().await;
        if !report.fired.is_empty() || !report.released.is_empty() {
            debug!(fired = ?report.fired, released = ?report.released, "Optimization pass acted");
        }
    }
}
