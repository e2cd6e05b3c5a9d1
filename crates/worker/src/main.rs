mod services;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use podforge_infra::Settings;
use podforge_infra::jobs::{DeadlineSweeper, JobWorker, WorkerPool, backfill_durations};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "podforge-worker",
    version,
    about = "Turns uploaded documents into two-host podcast episodes"
)]
struct Cli {
    /// Defaults to `run`.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Command {
    /// Run the worker pool and the deadline sweeper until interrupted.
    Run,
    /// One sweep pass over stuck jobs.
    Sweep,
    /// Measure and store missing durations of completed jobs.
    Backfill,
    /// Apply the Postgres schema.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    podforge_observability::init();

    let command = cli.command.unwrap_or(Command::Run);
    let settings = Settings::from_env().context("invalid configuration")?;

    match command {
        Command::Run => run(&settings).await,
        Command::Sweep => {
            let backends = services::backends(&settings).await?;
            let sweeper = DeadlineSweeper::new(
                backends.store,
                backends.queue,
                settings.stale_heartbeat_after(),
            );
            let report = sweeper.sweep_once().await?;
            info!(examined = report.examined, swept = report.swept, "sweep complete");
            Ok(())
        }
        Command::Backfill => {
            let backends = services::backends(&settings).await?;
            let blobs = services::blob_store(&settings)?;
            let report = backfill_durations(
                backends.store.as_ref(),
                blobs,
                services::audio_tooling(&settings),
                &settings.pipeline.workspace_root,
            )
            .await?;
            info!(updated = report.updated, failed = report.failed, "backfill complete");
            Ok(())
        }
        Command::Migrate => services::migrate(&settings).await,
    }
}

async fn run(settings: &Settings) -> anyhow::Result<()> {
    let backends = services::backends(settings).await?;
    let pipeline = services::pipeline(settings)?;

    let worker = Arc::new(JobWorker::new(
        Arc::clone(&backends.store),
        Arc::clone(&backends.queue),
        Arc::new(pipeline),
        backends.quota,
        settings.worker_config(),
    ));
    let pool = WorkerPool::new(worker, Arc::clone(&backends.queue), settings.pool_config()).spawn();
    let sweeper = DeadlineSweeper::new(
        backends.store,
        backends.queue,
        settings.stale_heartbeat_after(),
    )
    .spawn(settings.worker.sweep_interval);

    info!(
        workers = settings.worker.workers,
        persistent = settings.storage.use_persistent_stores,
        "podforge worker running"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    warn!("shutdown requested, waiting for in-flight attempts");
    let stats = pool.stats();
    sweeper.shutdown().await;
    pool.shutdown().await;
    info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        failed = stats.failed,
        retried = stats.retried,
        "podforge worker stopped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use clap::error::ErrorKind;

    fn command(args: &[&str]) -> Result<Option<Command>, clap::Error> {
        Cli::try_parse_from(std::iter::once("podforge-worker").chain(args.iter().copied()))
            .map(|cli| cli.command)
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_subcommands() {
        assert_eq!(command(&[]).unwrap(), None);
        assert_eq!(command(&["run"]).unwrap(), Some(Command::Run));
        assert_eq!(command(&["sweep"]).unwrap(), Some(Command::Sweep));
        assert_eq!(command(&["backfill"]).unwrap(), Some(Command::Backfill));
        assert_eq!(command(&["migrate"]).unwrap(), Some(Command::Migrate));
    }

    #[test]
    fn rejects_unknown_input_with_usage() {
        assert_eq!(
            command(&["serve"]).unwrap_err().kind(),
            ErrorKind::InvalidSubcommand
        );
        assert_eq!(
            command(&["sweep", "--force"]).unwrap_err().kind(),
            ErrorKind::UnknownArgument
        );
        assert_eq!(command(&["--help"]).unwrap_err().kind(), ErrorKind::DisplayHelp);
    }
}
