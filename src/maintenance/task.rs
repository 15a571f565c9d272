/*!
 * Maintenance Tasks
 * Task records and the shell runner that executes them
 */

use super::schedule::Schedule;
use crate::core::serde::{is_false, is_none};
use crate::core::types::TimestampMs;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceTask {
    pub name: String,
    /// Shell command, run with `sh -c`
    pub command: String,
    pub schedule: Schedule,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "is_none")]
    pub next_run_at: Option<TimestampMs>,
    #[serde(default, skip_serializing_if = "is_none")]
    pub last_run: Option<TaskRun>,
}

fn enabled_by_default() -> bool {
    true
}

impl MaintenanceTask {
    pub fn new(name: impl Into<String>, command: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            schedule,
            enabled: true,
            next_run_at: None,
            last_run: None,
        }
    }

    #[inline]
    pub fn is_due(&self, now: TimestampMs) -> bool {
        self.enabled && matches!(self.next_run_at, Some(at) if at <= now)
    }
}

/// Outcome of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub started_at: TimestampMs,
    pub finished_at: TimestampMs,
    /// None when killed by a signal, timed out, or never spawned
    pub exit_code: Option<i32>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub timed_out: bool,
    /// Tail of combined stdout and stderr
    pub output: String,
}

/// Raw result of running a command, before timestamps are attached
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub output: String,
}

/// Run `command` through the shell. The child is killed if `timeout` expires.
pub(crate) async fn run_shell(command: &str, timeout: Duration, excerpt_limit: usize) -> CommandOutcome {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            return CommandOutcome {
                exit_code: None,
                success: false,
                timed_out: false,
                output: format!("spawn failed: {}", e),
            }
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            CommandOutcome {
                exit_code: output.status.code(),
                success: output.status.success(),
                timed_out: false,
                output: excerpt(&combined, excerpt_limit),
            }
        }
        Ok(Err(e)) => CommandOutcome {
            exit_code: None,
            success: false,
            timed_out: false,
            output: format!("wait failed: {}", e),
        },
        Err(_) => CommandOutcome {
            exit_code: None,
            success: false,
            timed_out: true,
            output: format!("timed out after {}s", timeout.as_secs()),
        },
    }
}

/// Last `limit` bytes of `raw`, cut on a character boundary
pub(crate) fn excerpt(raw: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end();
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
