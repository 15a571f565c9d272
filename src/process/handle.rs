/*!
 * Process Handle
 *
 * The OS process owned by one instance. Only the supervisor holds handles;
 * every other component looks processes up by instance id.
 */

use crate::core::types::TimestampMs;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

/// Poll period while waiting for an adopted (non-child) process to exit
const ADOPTED_EXIT_POLL: Duration = Duration::from_millis(100);

/// Exclusive handle to an instance's process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    child: Option<Child>,
    started_at: TimestampMs,
}

impl ProcessHandle {
    /// Own a spawned child process
    pub fn from_child(child: Child, started_at: TimestampMs) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
            started_at,
        }
    }

    /// Track a process that is not our child (recovered after a restart),
    /// or nothing at all when `pid` is `None`
    pub fn adopted(pid: Option<u32>, started_at: TimestampMs) -> Self {
        Self {
            pid,
            child: None,
            started_at,
        }
    }

    #[inline]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[inline]
    pub fn started_at(&self) -> TimestampMs {
        self.started_at
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    /// Whether the process is still running (reaps an exited child)
    pub fn is_alive(&mut self) -> bool {
        if let Some(child) = self.child.as_mut() {
            return matches!(child.try_wait(), Ok(None));
        }
        self.pid.map(pid_alive).unwrap_or(false)
    }

    /// Deliver `sig` to the process
    pub fn signal(&self, sig: Signal) -> io::Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no process"))?;
        signal::kill(Pid::from_raw(pid as i32), sig).map_err(io::Error::from)
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Already-exited is success.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        if let Some(mut child) = self.child.take() {
            let pid = self.pid.take();
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            if let Some(raw) = child.id() {
                let _ = signal::kill(Pid::from_raw(raw as i32), Signal::SIGTERM);
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    debug!(?pid, ?status, "Process exited after SIGTERM");
                }
                Err(_) => {
                    warn!(?pid, "Process ignored SIGTERM, killing");
                    child.kill().await?;
                }
            }
            return Ok(());
        }

        let Some(pid) = self.pid.take() else {
            return Ok(());
        };
        if !pid_alive(pid) {
            return Ok(());
        }
        let target = Pid::from_raw(pid as i32);
        let _ = signal::kill(target, Signal::SIGTERM);

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !pid_alive(pid) {
                return Ok(());
            }
            tokio::time::sleep(ADOPTED_EXIT_POLL).await;
        }
        warn!(pid, "Adopted process ignored SIGTERM, killing");
        match signal::kill(target, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

/// Signal-0 liveness check that treats zombies as dead
pub fn pid_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rfind(')')
            .and_then(|i| stat[i + 1..].split_whitespace().next())
            .map(|state| state != "Z" && state != "X")
            .unwrap_or(true),
        Err(_) => true,
    }
}
