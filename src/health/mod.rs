/*!
 * Health Module
 * Liveness probes and the periodic monitor that drives degradation
 */

pub mod monitor;
pub mod probe;

pub use monitor::{HealthMonitor, ProbeReport};
pub use probe::{probe_within, NetworkProber, ProbeSpec, ProbeTarget, Prober};
