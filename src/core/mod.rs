/*!
 * Core Module
 * Fundamental orchestrator types, configuration and error handling
 */

pub mod clock;
pub mod config;
pub mod errors;
pub mod guard;
pub mod limits;
pub mod periodic;
pub mod serde;
pub mod types;

// Re-export for convenience
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::OrchestratorConfig;
pub use errors::*;
pub use guard::{guarded_call, GuardedOutcome};
pub use periodic::{PeriodicJob, PeriodicTask, TaskCommand};
pub use types::*;
