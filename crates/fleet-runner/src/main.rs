use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use fleet_observe::logger_init;
use fleet_session::SshConnector;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod controller;
mod error;
mod host;
mod inventory;
mod metadata;

use config::RunnerConfig;
use controller::RunController;

/// Energy measurement campaigns over a fleet of virtual machines.
#[derive(Debug, Parser)]
#[command(name = "fleet-runner", version, about)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Seconds to sample counters per run.
    #[arg(short, long, value_name = "SECS")]
    measure_interval: Option<u64>,

    /// Runs per experiment.
    #[arg(short, long)]
    runs: Option<u32>,

    /// Experiments to run, in order.
    #[arg(short, long = "experiment-names", value_name = "NAME", num_args = 1..)]
    experiment_names: Vec<String>,

    /// Leave the VMs running after each run.
    #[arg(short, long)]
    keep_vms: bool,

    /// Log filter, e.g. `info` or `fleet=debug`.
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, cfg: &mut RunnerConfig) {
        if let Some(secs) = self.measure_interval {
            cfg.measure_interval = secs;
        }
        if let Some(runs) = self.runs {
            cfg.runs = runs;
        }
        if !self.experiment_names.is_empty() {
            cfg.experiments = self.experiment_names;
        }
        cfg.keep_vms |= self.keep_vms;
        if let Some(level) = self.log_level {
            cfg.logger.level = level;
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("fleet-runner: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => RunnerConfig::load(path).context("loading configuration")?,
        None => RunnerConfig::default(),
    };
    cli.apply(&mut cfg);
    logger_init(&cfg.logger).context("initialising logger")?;

    if cfg.experiments.is_empty() {
        anyhow::bail!("no experiment selected (use --experiment-names)");
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(target: "fleet.runner", "interrupt received, stopping after the current phase");
                shutdown.cancel();
            }
        });
    }

    let connector = Arc::new(SshConnector::new(cfg.ssh.to_ssh_config()));
    let controller = RunController::new(cfg, connector, shutdown).context("building run controller")?;
    info!(
        target: "fleet.runner",
        experiments = ?controller.config().experiments,
        runs = controller.config().runs,
        measure_interval_s = controller.config().measure_interval,
        "campaign started"
    );

    let summary = controller.run_all().await;
    info!(
        target: "fleet.runner",
        completed = summary.completed,
        skipped = summary.skipped,
        failed = summary.failed,
        "campaign finished"
    );
    if summary.failed > 0 {
        anyhow::bail!("{} run(s) failed", summary.failed);
    }
    Ok(())
}
