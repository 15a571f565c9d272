/*!
 * Resource Ledger
 *
 * Authoritative accounting of granted budgets against the host limit
 * (`capacity * safety_margin`). Every read-check-commit runs as one
 * transaction under a single lock, so the granted sum can never exceed
 * the limit regardless of how many admissions race.
 */

use super::rebalance::{plan_reclaim, BudgetChange, ShareEntry};
use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::types::{Budget, InstanceId, Priority, Resource};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Grant {
    priority: Priority,
    requested: Budget,
    granted: Budget,
}

/// Result of a successful debit
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerAdmission {
    pub granted: Budget,
    /// Lower-priority grants that were shrunk to make room
    pub reclaimed: Vec<BudgetChange>,
}

/// Point-in-time ledger totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub capacity: Budget,
    pub safety_margin: f64,
    pub limit: Budget,
    pub allocated: Budget,
    pub available: Budget,
    pub grants: usize,
}

/// Budget ledger
#[derive(Debug)]
pub struct ResourceLedger {
    capacity: Budget,
    safety_margin: f64,
    min_grant_fraction: f64,
    grants: Mutex<HashMap<InstanceId, Grant>>,
}

impl ResourceLedger {
    pub fn new(capacity: Budget, safety_margin: f64, min_grant_fraction: f64) -> Self {
        info!(
            capacity = %capacity,
            safety_margin,
            "Resource ledger initialized"
        );
        Self {
            capacity,
            safety_margin,
            min_grant_fraction,
            grants: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn capacity(&self) -> Budget {
        self.capacity
    }

    /// Admissible total: capacity scaled by the safety margin
    #[inline]
    pub fn limit(&self) -> Budget {
        self.capacity.scale(self.safety_margin)
    }

    pub fn allocated(&self) -> Budget {
        Self::sum(&self.grants.lock())
    }

    pub fn available(&self) -> Budget {
        self.limit().saturating_sub(&self.allocated())
    }

    pub fn granted(&self, id: &InstanceId) -> Option<Budget> {
        self.grants.lock().get(id).map(|g| g.granted)
    }

    pub fn holds(&self, id: &InstanceId) -> bool {
        self.grants.lock().contains_key(id)
    }

    /// Debit `requested` for `id`, shrinking lower-priority grants if needed.
    ///
    /// The new grant is always the full request; if the deficit cannot be
    /// covered without pushing a victim below its floor, nothing changes.
    /// Re-admitting an id that already holds a grant returns that grant.
    pub fn admit(
        &self,
        id: &InstanceId,
        priority: Priority,
        requested: Budget,
    ) -> OrchestratorResult<LedgerAdmission> {
        let limit = self.limit();
        let mut grants = self.grants.lock();

        if let Some(existing) = grants.get(id) {
            return Ok(LedgerAdmission {
                granted: existing.granted,
                reclaimed: Vec::new(),
            });
        }

        let allocated = Self::sum(&grants);
        let projected = allocated.add(&requested);

        if projected.fits_within(&limit) {
            grants.insert(
                id.clone(),
                Grant {
                    priority,
                    requested,
                    granted: requested,
                },
            );
            debug!(%id, granted = %requested, "Budget debited");
            return Ok(LedgerAdmission {
                granted: requested,
                reclaimed: Vec::new(),
            });
        }

        let deficit = projected.excess_over(&limit);
        let entries = Self::entries(&grants);
        let Some(changes) = plan_reclaim(&entries, &deficit, priority, self.min_grant_fraction)
        else {
            let available = limit.saturating_sub(&allocated);
            let resource = Resource::ALL
                .into_iter()
                .find(|r| deficit.get(*r) > 0.0)
                .unwrap_or(Resource::Cpu);
            warn!(
                %id,
                resource = resource.name(),
                requested = requested.get(resource),
                available = available.get(resource),
                "Admission rejected: insufficient budget"
            );
            return Err(OrchestratorError::exhausted(
                resource.name(),
                requested.get(resource),
                available.get(resource),
            ));
        };

        for change in &changes {
            if let Some(grant) = grants.get_mut(&change.id) {
                grant.granted = change.to;
            }
        }
        grants.insert(
            id.clone(),
            Grant {
                priority,
                requested,
                granted: requested,
            },
        );
        info!(
            %id,
            granted = %requested,
            reclaimed_from = changes.len(),
            "Budget debited after reclaiming from lower-priority instances"
        );

        Ok(LedgerAdmission {
            granted: requested,
            reclaimed: changes,
        })
    }

    /// Re-register a grant recovered from persisted state
    pub fn restore(
        &self,
        id: &InstanceId,
        priority: Priority,
        requested: Budget,
        granted: Budget,
    ) -> OrchestratorResult<()> {
        let limit = self.limit();
        let mut grants = self.grants.lock();
        let previous = grants.get(id).map(|g| g.granted).unwrap_or(Budget::ZERO);
        let projected = Self::sum(&grants).saturating_sub(&previous).add(&granted);
        if !projected.fits_within(&limit) {
            let excess = projected.excess_over(&limit);
            let resource = Resource::ALL
                .into_iter()
                .find(|r| excess.get(*r) > 0.0)
                .unwrap_or(Resource::Cpu);
            return Err(OrchestratorError::exhausted(
                resource.name(),
                granted.get(resource),
                limit.saturating_sub(&Self::sum(&grants)).get(resource),
            ));
        }
        grants.insert(
            id.clone(),
            Grant {
                priority,
                requested,
                granted,
            },
        );
        Ok(())
    }

    /// Return `id`'s grant to the pool. Crediting twice is a no-op.
    pub fn credit(&self, id: &InstanceId) -> Option<Budget> {
        let released = self.grants.lock().remove(id).map(|g| g.granted);
        if let Some(budget) = released {
            debug!(%id, released = %budget, "Budget credited");
        }
        released
    }

    /// Current grants in a form the rebalancer understands
    pub fn share_entries(&self) -> Vec<ShareEntry> {
        Self::entries(&self.grants.lock())
    }

    /// Apply a batch of grant changes atomically.
    ///
    /// Rejected as a whole when any target exceeds its request, names an
    /// unknown id, or would push the total over the limit.
    pub fn apply_changes(&self, changes: &[BudgetChange]) -> OrchestratorResult<()> {
        let limit = self.limit();
        let mut grants = self.grants.lock();

        let mut next = grants.clone();
        for change in changes {
            let grant = next.get_mut(&change.id).ok_or_else(|| {
                OrchestratorError::NotFound(change.id.clone())
            })?;
            if !change.to.is_valid() || !change.to.fits_within(&grant.requested) {
                return Err(OrchestratorError::ConfigInvalid(format!(
                    "grant for {} ({}) exceeds its request ({})",
                    change.id, change.to, grant.requested
                )));
            }
            grant.granted = change.to;
        }

        let total = Self::sum(&next);
        if !total.fits_within(&limit) {
            let excess = total.excess_over(&limit);
            let resource = Resource::ALL
                .into_iter()
                .find(|r| excess.get(*r) > 0.0)
                .unwrap_or(Resource::Cpu);
            return Err(OrchestratorError::exhausted(
                resource.name(),
                total.get(resource),
                limit.get(resource),
            ));
        }

        *grants = next;
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let grants = self.grants.lock();
        let allocated = Self::sum(&grants);
        let limit = self.limit();
        LedgerSnapshot {
            capacity: self.capacity,
            safety_margin: self.safety_margin,
            limit,
            allocated,
            available: limit.saturating_sub(&allocated),
            grants: grants.len(),
        }
    }

    fn sum(grants: &HashMap<InstanceId, Grant>) -> Budget {
        grants
            .values()
            .fold(Budget::ZERO, |acc, g| acc.add(&g.granted))
    }

    fn entries(grants: &HashMap<InstanceId, Grant>) -> Vec<ShareEntry> {
        let mut entries: Vec<ShareEntry> = grants
            .iter()
            .map(|(id, g)| ShareEntry {
                id: id.clone(),
                priority: g.priority,
                requested: g.requested,
                granted: g.granted,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ledger() -> ResourceLedger {
        ResourceLedger::new(Budget::new(100.0, 2048.0, 10240.0), 0.9, 0.5)
    }

    #[test]
    fn test_limit_applies_safety_margin() {
        let limit = ledger().limit();
        assert!((limit.cpu_percent - 90.0).abs() < 1e-9);
        assert!((limit.memory_mb - 1843.2).abs() < 1e-9);
    }

    #[test]
    fn test_admit_and_credit() {
        let ledger = ledger();
        let id: InstanceId = "svc-a".into();
        let admitted = ledger
            .admit(&id, Priority::Medium, Budget::new(40.0, 512.0, 0.0))
            .unwrap();
        assert_eq!(admitted.granted.cpu_percent, 40.0);
        assert!(admitted.reclaimed.is_empty());
        assert_eq!(ledger.allocated().cpu_percent, 40.0);

        assert!(ledger.credit(&id).is_some());
        assert!(ledger.credit(&id).is_none());
        assert!(ledger.allocated().is_zero());
    }

    #[test]
    fn test_readmit_is_idempotent() {
        let ledger = ledger();
        let id: InstanceId = "svc-a".into();
        ledger.admit(&id, Priority::Low, Budget::new(40.0, 0.0, 0.0)).unwrap();
        ledger.admit(&id, Priority::Low, Budget::new(40.0, 0.0, 0.0)).unwrap();
        assert_eq!(ledger.allocated().cpu_percent, 40.0);
    }

    #[test]
    fn test_equal_priority_is_rejected() {
        let ledger = ledger();
        ledger
            .admit(&"svc-a".into(), Priority::Medium, Budget::new(50.0, 0.0, 0.0))
            .unwrap();
        let err = ledger
            .admit(&"svc-b".into(), Priority::Medium, Budget::new(50.0, 0.0, 0.0))
            .unwrap_err();
        assert_eq!(err, OrchestratorError::exhausted("cpu", 50.0, 40.0));
        assert_eq!(ledger.allocated().cpu_percent, 50.0);
    }

    #[test]
    fn test_high_priority_reclaims_from_low() {
        let ledger = ledger();
        ledger
            .admit(&"low".into(), Priority::Low, Budget::new(60.0, 0.0, 0.0))
            .unwrap();
        let admitted = ledger
            .admit(&"high".into(), Priority::High, Budget::new(50.0, 0.0, 0.0))
            .unwrap();
        assert_eq!(admitted.granted.cpu_percent, 50.0);
        assert_eq!(admitted.reclaimed.len(), 1);
        assert!((ledger.granted(&"low".into()).unwrap().cpu_percent - 40.0).abs() < 1e-9);
        assert!(ledger.allocated().fits_within(&ledger.limit()));
    }

    #[test]
    fn test_apply_changes_rejects_over_request() {
        let ledger = ledger();
        ledger
            .admit(&"a".into(), Priority::Low, Budget::new(20.0, 0.0, 0.0))
            .unwrap();
        let err = ledger
            .apply_changes(&[BudgetChange {
                id: "a".into(),
                from: Budget::new(20.0, 0.0, 0.0),
                to: Budget::new(30.0, 0.0, 0.0),
            }])
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigInvalid(_)));
        assert_eq!(ledger.granted(&"a".into()).unwrap().cpu_percent, 20.0);
    }

    #[test]
    fn test_concurrent_admissions_never_overcommit() {
        let ledger = Arc::new(ledger());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    ledger
                        .admit(
                            &format!("svc-{}", i).into(),
                            Priority::Medium,
                            Budget::new(10.0, 100.0, 0.0),
                        )
                        .is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 9);
        assert!(ledger.allocated().fits_within(&ledger.limit()));
    }
}
