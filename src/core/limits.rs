/*!
 * System Limits and Constants
 *
 * Centralized location for every default threshold, interval and bound.
 * `OrchestratorConfig` takes its defaults from here so that there is a single
 * place where numbers are decided.
 */

use std::time::Duration;

// =============================================================================
// CAPACITY & ADMISSION
// =============================================================================

/// Host CPU capacity (percent of all cores)
pub const HOST_CPU_CAPACITY_PERCENT: f64 = 100.0;

/// Memory assumed when /proc/meminfo cannot be read (2GB)
pub const FALLBACK_MEMORY_MB: f64 = 2048.0;

/// Default uplink budget (10 MB/s)
pub const DEFAULT_BANDWIDTH_KBPS: f64 = 10_240.0;

/// Fraction of capacity that may be granted to instances.
/// The rest is headroom for the OS and the orchestrator itself.
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.9;

/// Lowest fraction of its request a lower-priority instance can be shrunk to
/// when admission reclaims headroom
pub const DEFAULT_MIN_GRANT_FRACTION: f64 = 0.5;

/// Auto-assigned port range
pub const DEFAULT_PORT_RANGE_START: u16 = 8000;
pub const DEFAULT_PORT_RANGE_END: u16 = 8999;

/// Rebalance weights
pub const PRIORITY_WEIGHT_HIGH: f64 = 3.0;
pub const PRIORITY_WEIGHT_MEDIUM: f64 = 2.0;
pub const PRIORITY_WEIGHT_LOW: f64 = 1.0;

// =============================================================================
// THERMAL
// =============================================================================

/// Starting services above this temperature is refused
pub const THERMAL_UNSAFE_TO_START_C: f64 = 70.0;

/// Throttling directives fire above this temperature
pub const THERMAL_THROTTLE_HIGH_C: f64 = 65.0;

/// ... and re-arm once the device is back below this one
pub const THERMAL_THROTTLE_LOW_C: f64 = 55.0;

// =============================================================================
// HEALTH
// =============================================================================

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Must stay well below the check interval
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failures before Running -> Degraded
pub const HEALTH_FAILURE_THRESHOLD: u32 = 3;

/// Probe outcomes kept per instance
pub const HEALTH_HISTORY_CAPACITY: usize = 100;

/// Verification probes after a start before it counts as failed
pub const STARTUP_PROBE_ATTEMPTS: u32 = 3;
pub const STARTUP_PROBE_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// RECOVERY
// =============================================================================

pub const RECOVERY_MAX_ATTEMPTS: u32 = 3;
pub const RECOVERY_BACKOFF_BASE: Duration = Duration::from_secs(30);
pub const RECOVERY_BACKOFF_FACTOR: f64 = 2.0;

/// Quiet period after the last failed attempt before a fresh cycle
pub const RECOVERY_COOLDOWN: Duration = Duration::from_secs(300);

// =============================================================================
// OPTIMIZATION
// =============================================================================

pub const OPTIMIZATION_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// Samples folded into the moving average; actions wait for a full window
pub const OPTIMIZATION_EMA_WINDOW: u32 = 5;

/// Minimum spacing between two firings of the same action class
pub const OPTIMIZATION_REARM_INTERVAL: Duration = Duration::from_secs(60);

/// CPU deadband (percent of host)
pub const CPU_THRESHOLD_HIGH: f64 = 80.0;
pub const CPU_THRESHOLD_LOW: f64 = 65.0;

/// Memory deadband (percent of host)
pub const MEMORY_THRESHOLD_HIGH: f64 = 85.0;
pub const MEMORY_THRESHOLD_LOW: f64 = 70.0;

/// Rebalance deltas smaller than this are not applied
pub const REBALANCE_TOLERANCE_CPU: f64 = 1.0;
pub const REBALANCE_TOLERANCE_MEMORY_MB: f64 = 16.0;
pub const REBALANCE_TOLERANCE_BANDWIDTH_KBPS: f64 = 64.0;

/// Instances targeted by one corrective action
pub const MAX_DIRECTIVE_TARGETS: usize = 2;

// =============================================================================
// COLLABORATOR TIMEOUTS
// =============================================================================

pub const TEMPLATE_DEPLOY_TIMEOUT: Duration = Duration::from_secs(300);
pub const TEMPLATE_START_TIMEOUT: Duration = Duration::from_secs(60);
pub const TEMPLATE_STOP_TIMEOUT: Duration = Duration::from_secs(30);
pub const TEMPLATE_DELETE_TIMEOUT: Duration = Duration::from_secs(60);
pub const TEMPLATE_DIRECTIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// SIGTERM -> SIGKILL grace period for command instances
pub const PROCESS_STOP_GRACE: Duration = Duration::from_secs(10);

// =============================================================================
// STORAGE & MAINTENANCE
// =============================================================================

pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(5);
pub const STATE_FILE_VERSION: u32 = 1;
pub const DEFAULT_STATE_PATH: &str = "fleet-state.json";
pub const DEFAULT_TASKS_PATH: &str = "fleet-tasks.json";
pub const DEFAULT_LOG_DIR: &str = "logs";

pub const MAINTENANCE_TICK: Duration = Duration::from_secs(30);
pub const MAINTENANCE_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Bytes of task output kept in the task record
pub const MAINTENANCE_OUTPUT_EXCERPT: usize = 2048;

/// Broadcast buffer for fleet events
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
