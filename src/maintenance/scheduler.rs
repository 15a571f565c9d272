/*!
 * Maintenance Scheduler
 *
 * Keeps the task list, runs whatever is due on each tick and persists the
 * list (including each task's last run) with the same atomic JSON write as
 * the state store. Due tasks run concurrently as subprocesses bounded by the
 * task timeout. While the host is thermally unsafe nothing runs and the due
 * tasks stay due.
 */

use super::schedule::Schedule;
use super::task::{run_shell, MaintenanceTask, TaskRun};
use crate::core::clock::Clock;
use crate::core::config::MaintenanceConfig;
use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::limits::MAINTENANCE_OUTPUT_EXCERPT;
use crate::core::periodic::PeriodicJob;
use crate::events::{EventBus, FleetEvent};
use crate::resources::AdmissionController;
use crate::storage::{read_json, write_json_atomic};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskFile {
    tasks: Vec<MaintenanceTask>,
}

pub struct MaintenanceScheduler {
    path: PathBuf,
    task_timeout: Duration,
    tasks: Mutex<BTreeMap<String, MaintenanceTask>>,
    /// Serializes writes of the task file
    write_lock: tokio::sync::Mutex<()>,
    admission: Arc<AdmissionController>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl MaintenanceScheduler {
    pub fn new(
        config: &MaintenanceConfig,
        admission: Arc<AdmissionController>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            path: config.tasks_path.clone(),
            task_timeout: config.task_timeout,
            tasks: Mutex::new(BTreeMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            admission,
            events,
            clock,
        }
    }

    /// Load the task file; a missing file is an empty list.
    /// Returns the number of tasks loaded.
    pub async fn load(&self) -> OrchestratorResult<usize> {
        let Some(file) = read_json::<TaskFile>(&self.path).await? else {
            debug!(path = %self.path.display(), "No maintenance task file");
            return Ok(0);
        };
        let now = self.clock.now_ms();
        let mut loaded = BTreeMap::new();
        for mut task in file.tasks {
            if let Err(e) = task.schedule.validate() {
                warn!(task = %task.name, error = %e, "Skipping maintenance task");
                continue;
            }
            if task.next_run_at.is_none() {
                task.next_run_at = Some(task.schedule.next_after(now));
            }
            loaded.insert(task.name.clone(), task);
        }
        let count = loaded.len();
        *self.tasks.lock() = loaded;
        info!(path = %self.path.display(), tasks = count, "Maintenance tasks loaded");
        Ok(count)
    }

    pub async fn add_task(
        &self,
        name: &str,
        command: &str,
        schedule: Schedule,
    ) -> OrchestratorResult<MaintenanceTask> {
        schedule.validate()?;
        if name.trim().is_empty() || command.trim().is_empty() {
            return Err(OrchestratorError::ConfigInvalid(
                "maintenance task needs a name and a command".to_string(),
            ));
        }
        let mut task = MaintenanceTask::new(name, command, schedule);
        task.next_run_at = Some(schedule.next_after(self.clock.now_ms()));
        {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(name) {
                return Err(OrchestratorError::ConfigInvalid(format!(
                    "maintenance task '{}' already exists",
                    name
                )));
            }
            tasks.insert(name.to_string(), task.clone());
        }
        info!(task = name, schedule = %schedule, "Maintenance task added");
        self.save().await?;
        Ok(task)
    }

    pub async fn remove_task(&self, name: &str) -> OrchestratorResult<MaintenanceTask> {
        let removed = self
            .tasks
            .lock()
            .remove(name)
            .ok_or_else(|| OrchestratorError::TaskNotFound(name.to_string()))?;
        info!(task = name, "Maintenance task removed");
        self.save().await?;
        Ok(removed)
    }

    /// Enabling reschedules from now, so a long-disabled task does not run at once
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> OrchestratorResult<MaintenanceTask> {
        let now = self.clock.now_ms();
        let task = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .get_mut(name)
                .ok_or_else(|| OrchestratorError::TaskNotFound(name.to_string()))?;
            if enabled && !task.enabled {
                task.next_run_at = Some(task.schedule.next_after(now));
            }
            task.enabled = enabled;
            task.clone()
        };
        info!(task = name, enabled, "Maintenance task updated");
        self.save().await?;
        Ok(task)
    }

    pub fn list(&self) -> Vec<MaintenanceTask> {
        self.tasks.lock().values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<MaintenanceTask> {
        self.tasks.lock().get(name).cloned()
    }

    /// Run every due task. Returns the runs that happened, by task name.
    pub async fn run_due(&self) -> Vec<(String, TaskRun)> {
        let now = self.clock.now_ms();
        let due: Vec<MaintenanceTask> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        if due.is_empty() {
            return Vec::new();
        }
        if let Err(e) = self.admission.check_thermal().await {
            warn!(due = due.len(), error = %e, "Maintenance postponed");
            return Vec::new();
        }

        // Advance before running so an overlapping tick cannot start them twice
        {
            let mut tasks = self.tasks.lock();
            for task in &due {
                if let Some(entry) = tasks.get_mut(&task.name) {
                    entry.next_run_at = Some(entry.schedule.next_after(now));
                }
            }
        }

        let runs = join_all(due.iter().map(|task| self.execute(task))).await;
        let results: Vec<(String, TaskRun)> = due.into_iter().map(|t| t.name).zip(runs).collect();

        {
            let mut tasks = self.tasks.lock();
            for (name, run) in &results {
                if let Some(entry) = tasks.get_mut(name) {
                    entry.last_run = Some(run.clone());
                }
            }
        }
        if let Err(e) = self.save().await {
            warn!(error = %e, "Could not persist maintenance results");
        }
        results
    }

    /// Run one task immediately, regardless of its schedule
    pub async fn run_now(&self, name: &str) -> OrchestratorResult<TaskRun> {
        let task = self
            .get(name)
            .ok_or_else(|| OrchestratorError::TaskNotFound(name.to_string()))?;
        self.admission.check_thermal().await?;
        let run = self.execute(&task).await;
        if let Some(entry) = self.tasks.lock().get_mut(name) {
            entry.last_run = Some(run.clone());
        }
        self.save().await?;
        Ok(run)
    }

    async fn execute(&self, task: &MaintenanceTask) -> TaskRun {
        info!(task = %task.name, schedule = %task.schedule, "Running maintenance task");
        let started_at = self.clock.now_ms();
        let outcome = run_shell(&task.command, self.task_timeout, MAINTENANCE_OUTPUT_EXCERPT).await;
        let run = TaskRun {
            started_at,
            finished_at: self.clock.now_ms(),
            exit_code: outcome.exit_code,
            success: outcome.success,
            timed_out: outcome.timed_out,
            output: outcome.output,
        };
        if run.success {
            info!(task = %task.name, "Maintenance task succeeded");
        } else {
            warn!(
                task = %task.name,
                exit_code = ?run.exit_code,
                timed_out = run.timed_out,
                output = %run.output,
                "Maintenance task failed"
            );
        }
        self.events.emit(FleetEvent::MaintenanceRun {
            task: task.name.clone(),
            success: run.success,
        });
        run
    }

    async fn save(&self) -> OrchestratorResult<()> {
        let _write = self.write_lock.lock().await;
        let file = TaskFile { tasks: self.list() };
        write_json_atomic(&self.path, &file).await
    }
}

#[async_trait]
impl PeriodicJob for MaintenanceScheduler {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    async fn tick(&self) {
        let runs = self.run_due().await;
        if !runs.is_empty() {
            debug!(ran = runs.len(), "Maintenance round complete");
        }
    }
}
