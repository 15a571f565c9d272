/*!
 * Resources
 * Budget ledger, port registry, admission and fair-share rebalancing
 */

pub mod admission;
pub mod ledger;
pub mod ports;
pub mod rebalance;

pub use admission::{Admission, AdmissionController};
pub use ledger::{LedgerAdmission, LedgerSnapshot, ResourceLedger};
pub use ports::PortRegistry;
pub use rebalance::{fair_shares, plan_reclaim, plan_rebalance, BudgetChange, ShareEntry};
