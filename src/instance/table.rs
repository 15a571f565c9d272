/*!
 * Instance Table
 * Concurrent in-memory registry of instances with a change revision
 */

use super::types::{InstanceStatus, ServiceInstance};
use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::types::{InstanceId, TimestampMs};
use ahash::RandomState;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared instance registry
///
/// Every mutation bumps `revision`, which the state store uses to skip
/// redundant writes and to never persist an older snapshot over a newer one.
#[derive(Clone, Default)]
pub struct InstanceTable {
    instances: Arc<DashMap<InstanceId, ServiceInstance, RandomState>>,
    revision: Arc<AtomicU64>,
}

impl InstanceTable {
    pub fn new() -> Self {
        Self {
            instances: Arc::new(DashMap::with_hasher(RandomState::new())),
            revision: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn insert(&self, instance: ServiceInstance) {
        self.instances.insert(instance.id.clone(), instance);
        self.bump();
    }

    pub fn get(&self, id: &InstanceId) -> Option<ServiceInstance> {
        self.instances.get(id).map(|entry| entry.value().clone())
    }

    pub fn require(&self, id: &InstanceId) -> OrchestratorResult<ServiceInstance> {
        self.get(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.clone()))
    }

    pub fn status(&self, id: &InstanceId) -> Option<InstanceStatus> {
        self.instances.get(id).map(|entry| entry.status)
    }

    #[inline]
    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances.contains_key(id)
    }

    /// Mutate one instance in place; the shard lock is held only for `f`
    pub(crate) fn update<R>(
        &self,
        id: &InstanceId,
        now: TimestampMs,
        f: impl FnOnce(&mut ServiceInstance) -> R,
    ) -> OrchestratorResult<R> {
        let result = {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;
            let result = f(entry.value_mut());
            entry.updated_at = now;
            result
        };
        self.bump();
        Ok(result)
    }

    pub(crate) fn remove(&self, id: &InstanceId) -> Option<ServiceInstance> {
        let removed = self.instances.remove(id).map(|(_, v)| v);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// All instances, ordered by creation time then id
    pub fn snapshot(&self) -> Vec<ServiceInstance> {
        let mut all: Vec<ServiceInstance> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn filter(&self, pred: impl Fn(&ServiceInstance) -> bool) -> Vec<ServiceInstance> {
        self.snapshot().into_iter().filter(|i| pred(i)).collect()
    }

    pub fn ids_with_status(&self, status: InstanceStatus) -> Vec<InstanceId> {
        self.filter(|i| i.status == status)
            .into_iter()
            .map(|i| i.id)
            .collect()
    }

    pub fn count_by_status(&self) -> BTreeMap<InstanceStatus, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.instances.iter() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }

    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    #[inline]
    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }
}
