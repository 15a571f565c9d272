/*!
 * Periodic Tasks
 *
 * Background loop shared by every timer-driven component (health checks,
 * load sampling, autosave, maintenance). A task ticks on a fixed interval,
 * skips missed ticks instead of bursting, and is controlled through a command
 * channel so it can be paused, triggered or shut down cleanly.
 */

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Work performed on every tick
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn tick(&self);
}

/// Control messages for a periodic task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCommand {
    /// Stop ticking (commands are still handled)
    Pause,
    Resume,
    /// Run one tick now
    Trigger,
    Shutdown,
}

/// Handle to a running periodic task
pub struct PeriodicTask {
    name: &'static str,
    command_tx: mpsc::UnboundedSender<TaskCommand>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn(job: Arc<dyn PeriodicJob>, period: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let name = job.name();
        let handle = tokio::spawn(run_loop(job, period, command_rx));
        info!(task = name, period_ms = period.as_millis() as u64, "Periodic task spawned");
        Self {
            name,
            command_tx,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pause(&self) {
        let _ = self.command_tx.send(TaskCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.command_tx.send(TaskCommand::Resume);
    }

    pub fn trigger(&self) {
        let _ = self.command_tx.send(TaskCommand::Trigger);
    }

    /// Stop the loop and wait for the in-flight tick to finish
    pub async fn shutdown(mut self) {
        let _ = self.command_tx.send(TaskCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(task = self.name, error = %e, "Periodic task shutdown error");
            } else {
                debug!(task = self.name, "Periodic task shutdown complete");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.command_tx.send(TaskCommand::Shutdown);
        }
    }
}

async fn run_loop(
    job: Arc<dyn PeriodicJob>,
    period: Duration,
    mut command_rx: mpsc::UnboundedReceiver<TaskCommand>,
) {
    let mut active = true;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if active {
                    job.tick().await;
                }
            }

            cmd = command_rx.recv() => {
                match cmd {
                    Some(TaskCommand::Pause) => {
                        debug!(task = job.name(), "Periodic task paused");
                        active = false;
                    }
                    Some(TaskCommand::Resume) => {
                        debug!(task = job.name(), "Periodic task resumed");
                        active = true;
                    }
                    Some(TaskCommand::Trigger) => job.tick().await,
                    Some(TaskCommand::Shutdown) | None => {
                        debug!(task = job.name(), "Periodic task shutting down");
                        break;
                    }
                }
            }
        }
    }
}
