/*!
 * Collaborator Call Guard
 *
 * Every call into an external template runs under a deadline and an unwind
 * boundary, so a hung or panicking collaborator can only fail its own
 * instance and never the coordinating process.
 */

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::warn;

/// Outcome of a guarded collaborator call
#[derive(Debug)]
pub enum GuardedOutcome<T> {
    /// The call finished (successfully or with its own error)
    Completed(T),
    /// The deadline elapsed first
    TimedOut,
    /// The collaborator panicked
    Panicked(String),
}

impl<T> GuardedOutcome<T> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Run `fut` with a deadline and panic isolation
pub async fn guarded_call<F, T>(operation: &str, deadline: Duration, fut: F) -> GuardedOutcome<T>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(deadline, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(value)) => GuardedOutcome::Completed(value),
        Ok(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            warn!(operation, panic = %message, "Collaborator panicked");
            GuardedOutcome::Panicked(message)
        }
        Err(_) => {
            warn!(operation, deadline_ms = deadline.as_millis() as u64, "Collaborator call timed out");
            GuardedOutcome::TimedOut
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
