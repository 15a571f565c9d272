/*!
 * Operation Guards
 * Per-instance mutual exclusion for lifecycle operations
 */

use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::types::InstanceId;
use ahash::RandomState;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held for the duration of one operation on one instance
pub type OperationGuard = OwnedMutexGuard<()>;

#[derive(Clone, Default)]
pub struct OperationGuards {
    locks: Arc<DashMap<InstanceId, Arc<Mutex<()>>, RandomState>>,
}

impl OperationGuards {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::with_hasher(RandomState::new())),
        }
    }

    fn lock_for(&self, id: &InstanceId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Acquire without waiting; a busy instance is `OperationInProgress`
    pub fn try_acquire(&self, id: &InstanceId) -> OrchestratorResult<OperationGuard> {
        self.lock_for(id)
            .try_lock_owned()
            .map_err(|_| OrchestratorError::OperationInProgress(id.clone()))
    }

    /// Wait for the instance to become free
    pub async fn acquire(&self, id: &InstanceId) -> OperationGuard {
        self.lock_for(id).lock_owned().await
    }

    pub fn is_busy(&self, id: &InstanceId) -> bool {
        self.locks
            .get(id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Forget a deleted instance's lock
    pub fn remove(&self, id: &InstanceId) {
        self.locks.remove(id);
    }
}
