/*!
 * Shared Test Fixtures
 * Recording template, scripted prober and settable load sampler
 */

#![allow(dead_code)]

use async_trait::async_trait;
use fleet_orchestrator::health::{ProbeSpec, ProbeTarget, Prober};
use fleet_orchestrator::monitoring::{LoadSample, LoadSampler, StaticThermalSampler};
use fleet_orchestrator::optimization::Directive;
use fleet_orchestrator::process::ProcessHandle;
use fleet_orchestrator::template::{ServiceTemplate, TemplateContext, TemplateError, TemplateResult};
use fleet_orchestrator::{
    Budget, Clock, InstanceId, InstanceSpec, InstanceStatus, Orchestrator, OrchestratorConfig,
    OrchestratorResult, ProbeOutcome, TimestampMs, TokioClock,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const FAKE_KIND: &str = "fake";

/// One collaborator call
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: &'static str,
    pub id: InstanceId,
    pub at: TimestampMs,
}

/// Template that records every call and fails on demand
pub struct FakeTemplate {
    clock: Arc<dyn Clock>,
    calls: Mutex<Vec<Call>>,
    directives: Mutex<Vec<(InstanceId, Directive)>>,
    pub fail_deploy: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    stop_delay: Mutex<Duration>,
}

impl FakeTemplate {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            calls: Mutex::new(Vec::new()),
            directives: Mutex::new(Vec::new()),
            fail_deploy: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            stop_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock() = delay;
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    /// Times of every `op` call, oldest first
    pub fn times(&self, op: &str) -> Vec<TimestampMs> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.at)
            .collect()
    }

    pub fn directives_for(&self, id: &InstanceId) -> Vec<Directive> {
        self.directives
            .lock()
            .iter()
            .filter(|(target, _)| target == id)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn directives(&self) -> Vec<(InstanceId, Directive)> {
        self.directives.lock().clone()
    }

    fn record(&self, op: &'static str, id: &InstanceId) {
        self.calls.lock().push(Call {
            op,
            id: id.clone(),
            at: self.clock.now_ms(),
        });
    }

    fn outcome(flag: &AtomicBool, what: &str) -> TemplateResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(TemplateError::Failed(format!("{} failed", what)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ServiceTemplate for FakeTemplate {
    fn kind(&self) -> &str {
        FAKE_KIND
    }

    async fn deploy(&self, ctx: &TemplateContext) -> TemplateResult<()> {
        self.record("deploy", &ctx.id);
        Self::outcome(&self.fail_deploy, "deploy")
    }

    async fn start(&self, ctx: &TemplateContext) -> TemplateResult<ProcessHandle> {
        self.record("start", &ctx.id);
        Self::outcome(&self.fail_start, "start")?;
        Ok(ProcessHandle::adopted(None, self.clock.now_ms()))
    }

    async fn stop(&self, ctx: &TemplateContext, _handle: &mut ProcessHandle) -> TemplateResult<()> {
        self.record("stop", &ctx.id);
        let delay = *self.stop_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Self::outcome(&self.fail_stop, "stop")
    }

    async fn delete(&self, ctx: &TemplateContext) -> TemplateResult<()> {
        self.record("delete", &ctx.id);
        Ok(())
    }

    fn probe(&self, _ctx: &TemplateContext) -> ProbeSpec {
        ProbeSpec::Tcp
    }

    async fn apply_directive(
        &self,
        ctx: &TemplateContext,
        _handle: &ProcessHandle,
        directive: &Directive,
    ) -> TemplateResult<()> {
        self.directives.lock().push((ctx.id.clone(), directive.clone()));
        Ok(())
    }
}

/// Prober whose answers the test controls
pub struct ScriptedProber {
    healthy: AtomicBool,
    overrides: Mutex<HashMap<InstanceId, bool>>,
    hanging: AtomicBool,
    probes: AtomicUsize,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            overrides: Mutex::new(HashMap::new()),
            hanging: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_instance(&self, id: &InstanceId, healthy: bool) {
        self.overrides.lock().insert(id.clone(), healthy);
    }

    /// Probes never answer until cleared
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> ProbeOutcome {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.hanging.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout * 10).await;
        }
        let healthy = self
            .overrides
            .lock()
            .get(&target.id)
            .copied()
            .unwrap_or_else(|| self.healthy.load(Ordering::SeqCst));
        if healthy {
            ProbeOutcome::Healthy { latency_ms: 1 }
        } else {
            ProbeOutcome::unhealthy("connection refused")
        }
    }
}

/// Load sampler returning whatever the test last set
pub struct FakeLoadSampler {
    sample: Mutex<LoadSample>,
}

impl FakeLoadSampler {
    pub fn new() -> Self {
        Self {
            sample: Mutex::new(LoadSample {
                cpu_percent: 10.0,
                memory_percent: 20.0,
                ..LoadSample::default()
            }),
        }
    }

    pub fn set_cpu(&self, cpu_percent: f64) {
        self.sample.lock().cpu_percent = cpu_percent;
    }

    pub fn set(&self, sample: LoadSample) {
        *self.sample.lock() = sample;
    }
}

#[async_trait]
impl LoadSampler for FakeLoadSampler {
    async fn sample(&self) -> OrchestratorResult<LoadSample> {
        Ok(*self.sample.lock())
    }
}

pub struct Fixture {
    pub orchestrator: Arc<Orchestrator>,
    pub template: Arc<FakeTemplate>,
    pub prober: Arc<ScriptedProber>,
    pub load: Arc<FakeLoadSampler>,
    pub thermal: Arc<StaticThermalSampler>,
    pub clock: Arc<TokioClock>,
    pub dir: TempDir,
}

/// Deterministic configuration rooted in `dir`: 100% CPU, 2048MB, margin 0.9
pub fn config(dir: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::testing();
    config.capacity.cpu_percent = 100.0;
    config.capacity.memory_mb = Some(2048.0);
    config.admission.safety_margin = 0.9;
    config.storage.state_path = dir.join("state.json");
    config.storage.log_dir = dir.join("logs");
    config.maintenance.tasks_path = dir.join("tasks.json");
    config
}

pub fn fixture() -> Fixture {
    fixture_with(|_| {})
}

pub fn fixture_with(tweak: impl FnOnce(&mut OrchestratorConfig)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    tweak(&mut config);
    let clock = Arc::new(TokioClock::new());
    let template = Arc::new(FakeTemplate::new(clock.clone()));
    let prober = Arc::new(ScriptedProber::new());
    let load = Arc::new(FakeLoadSampler::new());
    let thermal = Arc::new(StaticThermalSampler::new(Some(40.0)));
    let orchestrator = Orchestrator::builder(config)
        .with_template(template.clone())
        .with_prober(prober.clone())
        .with_load_sampler(load.clone())
        .with_thermal_sampler(thermal.clone())
        .with_clock(clock.clone())
        .build()
        .unwrap();
    Fixture {
        orchestrator: Arc::new(orchestrator),
        template,
        prober,
        load,
        thermal,
        clock,
        dir,
    }
}

impl Fixture {
    /// A second orchestrator over the same state directory and fakes
    pub fn reopen(&self) -> Orchestrator {
        Orchestrator::builder(self.orchestrator.config().clone())
            .with_template(self.template.clone())
            .with_prober(self.prober.clone())
            .with_load_sampler(self.load.clone())
            .with_thermal_sampler(self.thermal.clone())
            .with_clock(self.clock.clone())
            .build()
            .unwrap()
    }

    pub async fn running(&self, cpu: f64, memory_mb: f64) -> InstanceId {
        self.running_spec(spec(cpu, memory_mb)).await
    }

    pub async fn running_spec(&self, spec: InstanceSpec) -> InstanceId {
        let id = self.orchestrator.create_instance(spec).await.unwrap();
        self.orchestrator.start(&id).await.unwrap();
        assert_eq!(self.status(&id), InstanceStatus::Running);
        id
    }

    pub fn status(&self, id: &InstanceId) -> InstanceStatus {
        self.orchestrator.get_status(id).unwrap().status
    }
}

pub fn spec(cpu: f64, memory_mb: f64) -> InstanceSpec {
    InstanceSpec::new(FAKE_KIND, Budget::new(cpu, memory_mb, 0.0))
}

/// Poll (in virtual time) until `id` reaches `status`
pub async fn wait_for_status(orchestrator: &Orchestrator, id: &InstanceId, status: InstanceStatus, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if orchestrator.get_status(id).map(|r| r.status).ok() == Some(status) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

pub fn assert_near(actual: TimestampMs, expected: TimestampMs) {
    let diff = actual.abs_diff(expected);
    assert!(
        diff <= 100,
        "expected {} ms, got {} ms (off by {} ms)",
        expected,
        actual,
        diff
    );
}
