/*!
 * Command Template
 *
 * Built-in `command` kind: runs an arbitrary executable as the instance.
 *
 * Configuration keys:
 * - command: executable (required)
 * - args: whitespace-separated arguments
 * - workdir: working directory, created on deploy
 * - setup: shell snippet run once on deploy
 * - probe: "tcp" | "http" | "process" (default: http when health_path is set, else process)
 * - health_path / expected_status: HTTP probe settings
 *
 * The child gets `PORT` and `FLEET_INSTANCE_ID` in its environment and writes
 * stdout/stderr to `<log_dir>/<id>.log`.
 */

use super::traits::{ServiceTemplate, TemplateContext, TemplateError, TemplateResult};
use crate::core::clock::{Clock, SystemClock};
use crate::core::limits::PROCESS_STOP_GRACE;
use crate::health::ProbeSpec;
use crate::optimization::Directive;
use crate::process::ProcessHandle;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub const COMMAND_KIND: &str = "command";

pub struct CommandTemplate {
    grace: Duration,
}

impl CommandTemplate {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    async fn open_log(ctx: &TemplateContext) -> TemplateResult<std::fs::File> {
        tokio::fs::create_dir_all(&ctx.log_dir).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(ctx.log_path())
            .await?;
        Ok(file.into_std().await)
    }

    async fn run_setup(&self, ctx: &TemplateContext, script: &str) -> TemplateResult<()> {
        let log = Self::open_log(ctx).await?;
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .env("PORT", ctx.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        if let Some(dir) = ctx.config_value("workdir") {
            cmd.current_dir(dir);
        }
        let status = cmd.status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(TemplateError::Failed(format!("setup exited with {}", status)))
        }
    }
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self::new(PROCESS_STOP_GRACE)
    }
}

#[async_trait]
impl ServiceTemplate for CommandTemplate {
    fn kind(&self) -> &str {
        COMMAND_KIND
    }

    fn validate(&self, config: &BTreeMap<String, String>) -> TemplateResult<()> {
        if config.get("command").map_or(true, |c| c.trim().is_empty()) {
            return Err(TemplateError::InvalidConfig("'command' is required".into()));
        }
        match config.get("probe").map(String::as_str) {
            None | Some("tcp") | Some("http") | Some("process") => {}
            Some(other) => {
                return Err(TemplateError::InvalidConfig(format!(
                    "unknown probe '{}'",
                    other
                )))
            }
        }
        if let Some(status) = config.get("expected_status") {
            status.parse::<u16>().map_err(|_| {
                TemplateError::InvalidConfig(format!("expected_status '{}' is not a status code", status))
            })?;
        }
        Ok(())
    }

    async fn deploy(&self, ctx: &TemplateContext) -> TemplateResult<()> {
        tokio::fs::create_dir_all(&ctx.log_dir).await?;
        if let Some(dir) = ctx.config_value("workdir") {
            tokio::fs::create_dir_all(dir).await?;
        }
        if let Some(script) = ctx.config_value("setup") {
            info!(instance_id = %ctx.id, "Running setup");
            self.run_setup(ctx, script).await?;
        }
        Ok(())
    }

    async fn start(&self, ctx: &TemplateContext) -> TemplateResult<ProcessHandle> {
        let program = ctx
            .config_value("command")
            .ok_or_else(|| TemplateError::InvalidConfig("'command' is required".into()))?;
        let log = Self::open_log(ctx).await?;

        let mut cmd = Command::new(program);
        if let Some(args) = ctx.config_value("args") {
            cmd.args(args.split_whitespace());
        }
        if let Some(dir) = ctx.config_value("workdir") {
            cmd.current_dir(dir);
        }
        cmd.env("PORT", ctx.port.to_string())
            .env("FLEET_INSTANCE_ID", ctx.id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));

        let mut child = cmd
            .spawn()
            .map_err(|e| TemplateError::Failed(format!("cannot spawn '{}': {}", program, e)))?;

        if let Some(status) = child.try_wait()? {
            return Err(TemplateError::Failed(format!(
                "'{}' exited immediately with {}",
                program, status
            )));
        }

        let handle = ProcessHandle::from_child(child, SystemClock.now_ms());
        info!(instance_id = %ctx.id, pid = ?handle.pid(), port = ctx.port, "Process started");
        Ok(handle)
    }

    async fn stop(&self, ctx: &TemplateContext, handle: &mut ProcessHandle) -> TemplateResult<()> {
        handle.terminate(self.grace).await?;
        info!(instance_id = %ctx.id, "Process stopped");
        Ok(())
    }

    async fn delete(&self, ctx: &TemplateContext) -> TemplateResult<()> {
        match tokio::fs::remove_file(ctx.log_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn probe(&self, ctx: &TemplateContext) -> ProbeSpec {
        let health_path = ctx.config_value("health_path");
        match (ctx.config_value("probe"), health_path) {
            (Some("tcp"), _) => ProbeSpec::Tcp,
            (Some("process"), _) => ProbeSpec::ProcessAlive,
            (_, Some(path)) => ProbeSpec::Http {
                path: path.to_string(),
                expected_status: ctx
                    .config_value("expected_status")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(200),
            },
            (Some("http"), None) => ProbeSpec::http("/"),
            _ => ProbeSpec::ProcessAlive,
        }
    }

    async fn apply_directive(
        &self,
        ctx: &TemplateContext,
        handle: &ProcessHandle,
        directive: &Directive,
    ) -> TemplateResult<()> {
        let signal = match directive {
            Directive::ReduceWorkers { .. } => Signal::SIGUSR1,
            Directive::EvictCache => Signal::SIGUSR2,
            other => {
                debug!(instance_id = %ctx.id, directive = %other, "Directive has no signal mapping");
                return Ok(());
            }
        };
        handle.signal(signal)?;
        debug!(instance_id = %ctx.id, directive = %directive, ?signal, "Directive signalled");
        Ok(())
    }
}
