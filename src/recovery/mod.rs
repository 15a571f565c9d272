/*!
 * Recovery Module
 * Bounded, backed-off restarts of degraded instances
 */

pub mod backoff;
pub mod coordinator;

pub use backoff::{BackoffPolicy, RecoveryDecision};
pub use coordinator::RecoveryCoordinator;
