/*!
 * Maintenance Module
 * Recurring host tasks (backups, cleanup, disk checks) on calendar schedules
 */

mod schedule;
mod scheduler;
mod task;

pub use schedule::{Day, Schedule};
pub use scheduler::MaintenanceScheduler;
pub use task::{MaintenanceTask, TaskRun};
