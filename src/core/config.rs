/*!
 * Orchestrator Configuration
 *
 * One configuration surface for every threshold used by admission, health,
 * recovery and optimization. Loaded from JSON (all fields optional), then
 * overridden from the environment, then validated.
 *
 * Environment variables:
 * - FLEET_CONFIG: path of the JSON configuration file
 * - FLEET_STATE_PATH: override `storage.state_path`
 * - FLEET_SAFETY_MARGIN: override `admission.safety_margin`
 */

use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::limits::*;
use crate::core::serde::duration_secs;
use crate::core::types::{Budget, Priority};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub capacity: CapacityConfig,
    pub admission: AdmissionConfig,
    pub thermal: ThermalConfig,
    pub health: HealthConfig,
    pub recovery: RecoveryConfig,
    pub optimization: OptimizationConfig,
    pub timeouts: TemplateTimeouts,
    pub storage: StorageConfig,
    pub maintenance: MaintenanceConfig,
}

/// Host capacity; memory is detected when not given
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub cpu_percent: f64,
    pub memory_mb: Option<f64>,
    pub bandwidth_kbps: f64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            cpu_percent: HOST_CPU_CAPACITY_PERCENT,
            memory_mb: None,
            bandwidth_kbps: DEFAULT_BANDWIDTH_KBPS,
        }
    }
}

impl CapacityConfig {
    /// Resolve to a concrete budget, reading /proc/meminfo if needed
    pub fn resolve(&self) -> Budget {
        let memory_mb = self
            .memory_mb
            .unwrap_or_else(crate::monitoring::detect_total_memory_mb);
        Budget::new(self.cpu_percent, memory_mb, self.bandwidth_kbps)
    }
}

/// Rebalance weight per priority
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            high: PRIORITY_WEIGHT_HIGH,
            medium: PRIORITY_WEIGHT_MEDIUM,
            low: PRIORITY_WEIGHT_LOW,
        }
    }
}

impl PriorityWeights {
    #[inline]
    pub fn weight(&self, priority: Priority) -> f64 {
        match priority {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Fraction of capacity that may be granted (< 1.0)
    pub safety_margin: f64,
    pub min_grant_fraction: f64,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Skip auto-assigned ports that some foreign process already listens on
    pub skip_os_bound_ports: bool,
    pub priority_weights: PriorityWeights,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            min_grant_fraction: DEFAULT_MIN_GRANT_FRACTION,
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            skip_os_bound_ports: true,
            priority_weights: PriorityWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalConfig {
    pub unsafe_to_start_celsius: f64,
    pub throttle_high_celsius: f64,
    pub throttle_low_celsius: f64,
    /// Refuse admission when no temperature can be read
    pub reject_on_unknown: bool,
    pub zone_root: PathBuf,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            unsafe_to_start_celsius: THERMAL_UNSAFE_TO_START_C,
            throttle_high_celsius: THERMAL_THROTTLE_HIGH_C,
            throttle_low_celsius: THERMAL_THROTTLE_LOW_C,
            reject_on_unknown: false,
            zone_root: PathBuf::from("/sys/class/thermal"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub history_capacity: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: HEALTH_CHECK_INTERVAL,
            probe_timeout: HEALTH_PROBE_TIMEOUT,
            failure_threshold: HEALTH_FAILURE_THRESHOLD,
            history_capacity: HEALTH_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub backoff_base: Duration,
    pub backoff_factor: f64,
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
    /// Start a fresh recovery cycle once the cooldown has elapsed
    pub retry_after_cooldown: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RECOVERY_MAX_ATTEMPTS,
            backoff_base: RECOVERY_BACKOFF_BASE,
            backoff_factor: RECOVERY_BACKOFF_FACTOR,
            cooldown: RECOVERY_COOLDOWN,
            retry_after_cooldown: true,
        }
    }
}

/// High/low threshold pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Deadband {
    pub high: f64,
    pub low: f64,
}

impl Deadband {
    pub fn new(high: f64, low: f64) -> Self {
        Self { high, low }
    }

    fn validate(&self, name: &str) -> OrchestratorResult<()> {
        if !(self.low < self.high) {
            return Err(OrchestratorError::ConfigInvalid(format!(
                "{} deadband requires low < high (low={}, high={})",
                name, self.low, self.high
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    #[serde(with = "duration_secs")]
    pub sample_interval: Duration,
    pub ema_window: u32,
    pub cpu: Deadband,
    pub memory: Deadband,
    #[serde(with = "duration_secs")]
    pub rearm_interval: Duration,
    pub tolerance: Budget,
    pub max_targets: usize,
    /// Worker fraction requested by a reduce-workers directive
    pub reduce_workers_fraction: f64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            sample_interval: OPTIMIZATION_SAMPLE_INTERVAL,
            ema_window: OPTIMIZATION_EMA_WINDOW,
            cpu: Deadband::new(CPU_THRESHOLD_HIGH, CPU_THRESHOLD_LOW),
            memory: Deadband::new(MEMORY_THRESHOLD_HIGH, MEMORY_THRESHOLD_LOW),
            rearm_interval: OPTIMIZATION_REARM_INTERVAL,
            tolerance: Budget::new(
                REBALANCE_TOLERANCE_CPU,
                REBALANCE_TOLERANCE_MEMORY_MB,
                REBALANCE_TOLERANCE_BANDWIDTH_KBPS,
            ),
            max_targets: MAX_DIRECTIVE_TARGETS,
            reduce_workers_fraction: 0.75,
        }
    }
}

/// Deadline for each template collaborator call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateTimeouts {
    #[serde(with = "duration_secs")]
    pub deploy: Duration,
    #[serde(with = "duration_secs")]
    pub start: Duration,
    #[serde(with = "duration_secs")]
    pub stop: Duration,
    #[serde(with = "duration_secs")]
    pub delete: Duration,
    #[serde(with = "duration_secs")]
    pub directive: Duration,
}

impl Default for TemplateTimeouts {
    fn default() -> Self {
        Self {
            deploy: TEMPLATE_DEPLOY_TIMEOUT,
            start: TEMPLATE_START_TIMEOUT,
            stop: TEMPLATE_STOP_TIMEOUT,
            delete: TEMPLATE_DELETE_TIMEOUT,
            directive: TEMPLATE_DIRECTIVE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_path: PathBuf,
    #[serde(with = "duration_secs")]
    pub autosave_interval: Duration,
    pub log_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            autosave_interval: AUTOSAVE_INTERVAL,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub tasks_path: PathBuf,
    #[serde(with = "duration_secs")]
    pub tick: Duration,
    #[serde(with = "duration_secs")]
    pub task_timeout: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tasks_path: PathBuf::from(DEFAULT_TASKS_PATH),
            tick: MAINTENANCE_TICK,
            task_timeout: MAINTENANCE_TASK_TIMEOUT,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration: explicit path, else `FLEET_CONFIG`, else defaults
    pub fn load(path: Option<&Path>) -> OrchestratorResult<Self> {
        let env_path = std::env::var("FLEET_CONFIG").ok().map(PathBuf::from);
        let source = path.map(Path::to_path_buf).or(env_path);

        let mut config = match source {
            Some(ref p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    OrchestratorError::ConfigInvalid(format!("cannot read {}: {}", p.display(), e))
                })?;
                info!(path = %p.display(), "Loaded orchestrator configuration");
                Self::from_json(&raw)?
            }
            None => {
                debug!("No configuration file given, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> OrchestratorResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| OrchestratorError::ConfigInvalid(format!("malformed configuration: {}", e)))
    }

    fn apply_env_overrides(&mut self) -> OrchestratorResult<()> {
        if let Ok(path) = std::env::var("FLEET_STATE_PATH") {
            self.storage.state_path = PathBuf::from(path);
        }
        if let Ok(raw) = std::env::var("FLEET_SAFETY_MARGIN") {
            self.admission.safety_margin = raw.parse().map_err(|_| {
                OrchestratorError::ConfigInvalid(format!("FLEET_SAFETY_MARGIN is not a number: {}", raw))
            })?;
        }
        Ok(())
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> OrchestratorResult<()> {
        let invalid = |msg: String| Err(OrchestratorError::ConfigInvalid(msg));

        let margin = self.admission.safety_margin;
        if !(margin > 0.0 && margin < 1.0) {
            return invalid(format!("safety_margin must be in (0, 1), got {}", margin));
        }
        let fraction = self.admission.min_grant_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return invalid(format!("min_grant_fraction must be in [0, 1], got {}", fraction));
        }
        if self.admission.port_range_start == 0
            || self.admission.port_range_start > self.admission.port_range_end
        {
            return invalid(format!(
                "empty port range {}..={}",
                self.admission.port_range_start, self.admission.port_range_end
            ));
        }
        if self.capacity.cpu_percent <= 0.0 || self.capacity.bandwidth_kbps < 0.0 {
            return invalid("capacity must be positive".to_string());
        }
        if matches!(self.capacity.memory_mb, Some(m) if m <= 0.0) {
            return invalid("capacity.memory_mb must be positive".to_string());
        }
        if self.health.failure_threshold == 0 {
            return invalid("health.failure_threshold must be at least 1".to_string());
        }
        if self.health.probe_timeout >= self.health.interval {
            return invalid("health.probe_timeout must be shorter than health.interval".to_string());
        }
        if self.health.history_capacity == 0 {
            return invalid("health.history_capacity must be at least 1".to_string());
        }
        if self.recovery.backoff_factor < 1.0 {
            return invalid("recovery.backoff_factor must be >= 1.0".to_string());
        }
        if self.optimization.ema_window == 0 {
            return invalid("optimization.ema_window must be at least 1".to_string());
        }
        self.optimization.cpu.validate("cpu")?;
        self.optimization.memory.validate("memory")?;
        if !(self.thermal.throttle_low_celsius < self.thermal.throttle_high_celsius) {
            return invalid("thermal throttle deadband requires low < high".to_string());
        }
        if !(0.0..=1.0).contains(&self.optimization.reduce_workers_fraction) {
            return invalid("optimization.reduce_workers_fraction must be in [0, 1]".to_string());
        }
        Ok(())
    }

    /// Deterministic configuration for tests: fixed capacity, no OS port probing
    pub fn testing() -> Self {
        let mut config = Self::default();
        config.capacity.memory_mb = Some(2048.0);
        config.admission.skip_os_bound_ports = false;
        config.maintenance.enabled = false;
        config
    }
}
