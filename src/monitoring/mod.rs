/*!
 * Monitoring
 * Host load and thermal sampling, smoothing, and tracing setup
 */

mod ema;
mod load;
mod thermal;
mod tracer;

pub use ema::Ema;
pub use load::{detect_total_memory_mb, LoadSample, LoadSampler, ProcLoadSampler};
pub use thermal::{StaticThermalSampler, SysfsThermalSampler, ThermalSampler};
pub use tracer::{generate_correlation_id, init_tracing, instance_span, InstanceSpan};
