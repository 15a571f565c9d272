/*!
 * Budget Rebalancing
 *
 * Pure share computations used by admission (reclaim headroom from
 * lower-priority instances) and by the optimization loop (redistribute
 * capacity fairly by priority weight).
 *
 * Fair shares are computed per resource dimension by water-filling: each
 * round offers the remaining capacity in proportion to priority weight,
 * instances whose outstanding request fits their offer are satisfied, and
 * the surplus flows to the rest in the next round. No instance is ever
 * granted more than it requested, and the shares never sum above the limit.
 */

use crate::core::config::PriorityWeights;
use crate::core::types::{Budget, InstanceId, Priority, Resource};

const EPSILON: f64 = 1e-9;

/// Ledger view of one instance
#[derive(Debug, Clone, PartialEq)]
pub struct ShareEntry {
    pub id: InstanceId,
    pub priority: Priority,
    pub requested: Budget,
    pub granted: Budget,
}

/// A granted-budget adjustment
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetChange {
    pub id: InstanceId,
    pub from: Budget,
    pub to: Budget,
}

impl BudgetChange {
    /// True when the instance loses budget in some dimension
    pub fn is_reduction(&self) -> bool {
        Resource::ALL
            .iter()
            .any(|r| self.to.get(*r) + EPSILON < self.from.get(*r))
    }
}

/// Weighted fair share of `limit` for every entry, clamped to its request
pub fn fair_shares(entries: &[ShareEntry], limit: &Budget, weights: &PriorityWeights) -> Vec<Budget> {
    let mut shares = vec![Budget::ZERO; entries.len()];

    for resource in Resource::ALL {
        let mut remaining = limit.get(resource).max(0.0);
        let mut active: Vec<usize> = (0..entries.len())
            .filter(|i| entries[*i].requested.get(resource) > EPSILON)
            .collect();

        while !active.is_empty() && remaining > EPSILON {
            let total_weight: f64 = active
                .iter()
                .map(|i| weights.weight(entries[*i].priority).max(0.0))
                .sum();
            if total_weight <= EPSILON {
                break;
            }

            let mut satisfied = Vec::new();
            let mut handed_out = 0.0;
            for &i in &active {
                let offer = remaining * weights.weight(entries[i].priority).max(0.0) / total_weight;
                let need = entries[i].requested.get(resource) - shares[i].get(resource);
                if need <= offer + EPSILON {
                    shares[i].set(resource, entries[i].requested.get(resource));
                    handed_out += need;
                    satisfied.push(i);
                }
            }

            if satisfied.is_empty() {
                // Everyone wants more than their offer: split what is left and stop
                for &i in &active {
                    let offer =
                        remaining * weights.weight(entries[i].priority).max(0.0) / total_weight;
                    let current = shares[i].get(resource);
                    shares[i].set(resource, current + offer);
                }
                break;
            }

            remaining -= handed_out;
            active.retain(|i| !satisfied.contains(i));
        }
    }

    shares
}

/// Changes that move every entry to its fair share.
///
/// Deltas within `tolerance` are skipped to avoid churn, unless skipping them
/// would leave the total above `limit`, in which case every differing entry is
/// moved.
pub fn plan_rebalance(
    entries: &[ShareEntry],
    limit: &Budget,
    weights: &PriorityWeights,
    tolerance: &Budget,
) -> Vec<BudgetChange> {
    let targets = fair_shares(entries, limit, weights);

    let significant: Vec<BudgetChange> = entries
        .iter()
        .zip(targets.iter())
        .filter(|(entry, target)| target.exceeds_tolerance(&entry.granted, tolerance))
        .map(|(entry, target)| BudgetChange {
            id: entry.id.clone(),
            from: entry.granted,
            to: *target,
        })
        .collect();

    let projected = entries.iter().fold(Budget::ZERO, |acc, entry| {
        let granted = significant
            .iter()
            .find(|c| c.id == entry.id)
            .map(|c| c.to)
            .unwrap_or(entry.granted);
        acc.add(&granted)
    });

    if projected.fits_within(limit) {
        return significant;
    }

    entries
        .iter()
        .zip(targets)
        .filter(|(entry, target)| target.exceeds_tolerance(&entry.granted, &Budget::ZERO))
        .map(|(entry, target)| BudgetChange {
            id: entry.id.clone(),
            from: entry.granted,
            to: target,
        })
        .collect()
}

/// Shrink lower-priority instances to free `deficit`.
///
/// Only instances strictly below `requester` and at most Medium priority are
/// eligible, and none is shrunk below `min_fraction` of its request. Lowest
/// priority gives first. Returns `None` when the deficit cannot be covered.
pub fn plan_reclaim(
    entries: &[ShareEntry],
    deficit: &Budget,
    requester: Priority,
    min_fraction: f64,
) -> Option<Vec<BudgetChange>> {
    let mut victims: Vec<(ShareEntry, Budget)> = entries
        .iter()
        .filter(|e| e.priority < requester && e.priority <= Priority::Medium)
        .map(|e| (e.clone(), e.granted))
        .collect();

    for resource in Resource::ALL {
        let mut need = deficit.get(resource);
        if need <= EPSILON {
            continue;
        }

        victims.sort_by(|(a, a_now), (b, b_now)| {
            let a_spare = a_now.get(resource) - a.requested.get(resource) * min_fraction;
            let b_spare = b_now.get(resource) - b.requested.get(resource) * min_fraction;
            a.priority
                .cmp(&b.priority)
                .then_with(|| b_spare.partial_cmp(&a_spare).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.id.cmp(&b.id))
        });

        for (entry, current) in victims.iter_mut() {
            if need <= EPSILON {
                break;
            }
            let floor = entry.requested.get(resource) * min_fraction;
            let spare = (current.get(resource) - floor).max(0.0);
            let take = spare.min(need);
            current.set(resource, current.get(resource) - take);
            need -= take;
        }

        if need > EPSILON {
            return None;
        }
    }

    Some(
        victims
            .into_iter()
            .filter(|(entry, current)| current.exceeds_tolerance(&entry.granted, &Budget::ZERO))
            .map(|(entry, current)| BudgetChange {
                id: entry.id,
                from: entry.granted,
                to: current,
            })
            .collect(),
    )
}
