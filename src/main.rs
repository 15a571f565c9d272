/*!
 * fleetd - Main Entry Point
 *
 * Runs the orchestrator as a daemon:
 * - Loads configuration (`--config <path>` or FLEET_CONFIG)
 * - Restores persisted instances and resumes recovery
 * - Starts health, optimization, autosave and maintenance loops
 * - Flushes state on Ctrl+C / SIGTERM; service processes keep running
 */

use anyhow::{bail, Context};
use fleet_orchestrator::{init_tracing, Orchestrator, OrchestratorConfig};
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = parse_args(std::env::args().skip(1))?;
    let config = OrchestratorConfig::load(config_path.as_deref())
        .context("failed to load configuration")?;

    info!("fleetd starting...");
    info!("================================================");

    let orchestrator = Orchestrator::builder(config)
        .build()
        .context("failed to initialize orchestrator")?;

    let report = orchestrator
        .restore()
        .await
        .context("failed to restore state")?;
    info!(
        restored = report.restored,
        recovering = report.recovering.len(),
        maintenance_tasks = report.maintenance_tasks,
        "Fleet restored"
    );

    orchestrator.start_background();

    info!("fleetd ready");
    info!("================================================");

    let mut terminate = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("cannot listen for Ctrl+C")?,
        _ = terminate.recv() => {}
    }

    info!("Shutdown requested");
    orchestrator.shutdown().await?;
    Ok(())
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Option<PathBuf>> {
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(path) => config = Some(PathBuf::from(path)),
                None => bail!("--config requires a path"),
            },
            "--help" | "-h" => {
                println!("usage: fleetd [--config <path>]");
                std::process::exit(0);
            }
            other => bail!("unknown argument '{}'", other),
        }
    }
    Ok(config)
}
