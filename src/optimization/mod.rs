/*!
 * Optimization Module
 * Hysteresis-guarded load correction and fair-share rebalancing
 */

pub mod directives;
pub mod engine;
pub mod hysteresis;

pub use directives::{ActionClass, Directive, IssuedDirective};
pub use engine::{LoadReport, OptimizationEngine, OptimizationStatus, PassReport};
pub use hysteresis::{HysteresisTrigger, RearmGate, TriggerEvent, TriggerStatus};
