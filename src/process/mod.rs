/*!
 * Process Module
 * Instance supervision: lifecycle transitions, OS handles and per-instance serialization
 */

pub mod guard;
pub mod handle;
pub mod supervisor;
pub mod timers;

// Re-export for convenience
pub use guard::{OperationGuard, OperationGuards};
pub use handle::{pid_alive, ProcessHandle};
pub use supervisor::{ProcessSupervisor, Resume, SupervisorDeps};
pub use timers::RecoveryTimers;
