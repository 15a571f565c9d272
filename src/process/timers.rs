/*!
 * Recovery Timers
 *
 * Pending recovery work per instance. Cancelling aborts the task and waits
 * for it to unwind, so any operation guard it held is released before the
 * caller proceeds.
 */

use crate::core::types::InstanceId;
use ahash::RandomState;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Clone, Default)]
pub struct RecoveryTimers {
    tasks: Arc<DashMap<InstanceId, (u64, JoinHandle<()>), RandomState>>,
    generation: Arc<AtomicU64>,
}

impl RecoveryTimers {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(DashMap::with_hasher(RandomState::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Next generation number; pass it to the task so it can `finish` itself
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register `handle` for `id`, aborting whatever was pending
    pub fn arm(&self, id: &InstanceId, generation: u64, handle: JoinHandle<()>) {
        if let Some((_, previous)) = self.tasks.insert(id.clone(), (generation, handle)) {
            previous.abort();
        }
        debug!(instance_id = %id, generation, "Recovery timer armed");
    }

    /// Called by a task when it completes on its own
    pub fn finish(&self, id: &InstanceId, generation: u64) {
        self.tasks.remove_if(id, |_, (g, _)| *g == generation);
    }

    /// Abort pending recovery for `id` and wait until it has stopped
    pub async fn cancel(&self, id: &InstanceId) -> bool {
        let Some((_, (_, handle))) = self.tasks.remove(id) else {
            return false;
        };
        handle.abort();
        let _ = handle.await;
        debug!(instance_id = %id, "Recovery timer cancelled");
        true
    }

    pub fn is_pending(&self, id: &InstanceId) -> bool {
        self.tasks
            .get(id)
            .map(|entry| !entry.1.is_finished())
            .unwrap_or(false)
    }

    pub async fn cancel_all(&self) {
        let ids: Vec<InstanceId> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id).await;
        }
    }
}
