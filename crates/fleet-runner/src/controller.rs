//! One measurement campaign: experiments × runs.
use std::{sync::Arc, time::Duration};

use fleet_core::{
    Assets, Dispatcher, NodeProbe, PlanTable, RunContext, SampleLog, Sampler, SamplerStats, Stage,
    StageRouter,
};
use fleet_model::{NodeTarget, ProcessHandle, StageId};
use fleet_session::Connector;
use fleet_stages::{Disruption, Workload, register_builtin_stages};
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::RunnerConfig,
    error::RunnerError,
    host::{destroy_vms, drain_in_background, prepare_counter_dirs, start_local},
    inventory::{active_vm_count, load_inventory, process_table, vm_pids},
    metadata::{RunId, RunMetadata, secs},
};

/// Counts reported by [`RunController::run_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CampaignSummary {
    pub completed: u32,
    pub skipped: u32,
    pub failed: u32,
}

pub struct RunController {
    cfg: RunnerConfig,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl RunController {
    pub fn new(
        cfg: RunnerConfig,
        connector: Arc<dyn Connector>,
        shutdown: CancellationToken,
    ) -> Result<Self, RunnerError> {
        let mut table = PlanTable::builtin();
        if let Some(path) = &cfg.plan_table {
            table.merge(PlanTable::load(path)?);
        }

        let mut router = StageRouter::new();
        register_builtin_stages(&mut router, &cfg.stages);

        let ctx = RunContext::new(connector)
            .with_timeouts(cfg.timeouts.stage_timeouts())
            .with_assets(Assets::new(&cfg.assets_dir));

        Ok(Self {
            dispatcher: Dispatcher::new(table, router, Arc::new(ctx)),
            cfg,
            shutdown,
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.cfg
    }

    /// Run every configured experiment `runs` times.
    ///
    /// Runs with existing output are skipped; a failed run is logged and
    /// the campaign moves on.
    pub async fn run_all(&self) -> CampaignSummary {
        let mut summary = CampaignSummary::default();
        'campaign: for experiment in &self.cfg.experiments {
            info!(target: "fleet.runner.campaign", %experiment, runs = self.cfg.runs, "experiment started");
            for index in 0..self.cfg.runs {
                if self.shutdown.is_cancelled() {
                    warn!(target: "fleet.runner.campaign", "shutdown requested, campaign stopped");
                    break 'campaign;
                }
                let id = RunId::new(experiment.as_str(), index, self.cfg.measure_interval);
                if id.already_ran(&self.cfg.results_dir) {
                    info!(target: "fleet.runner.campaign", %experiment, run = %id.file_stem(), "run skipped, output exists");
                    summary.skipped += 1;
                    continue;
                }

                match self.run_once(&id).await {
                    Ok(meta) => {
                        info!(
                            target: "fleet.runner.campaign",
                            %experiment,
                            run = %meta.run,
                            samples = meta.samples,
                            failed_nodes = meta.failed_nodes.len(),
                            "run finished"
                        );
                        summary.completed += 1;
                    }
                    Err(e) => {
                        error!(target: "fleet.runner.campaign", %experiment, run = %id.file_stem(), error = %e, "run failed");
                        summary.failed += 1;
                    }
                }
                cooldown(self.cfg.cooldowns.between_runs).await;
            }
        }
        summary
    }

    /// Provision, configure, measure and tear down one run.
    pub async fn run_once(&self, id: &RunId) -> Result<RunMetadata, RunnerError> {
        let ctx = self.dispatcher.context();
        let mut meta = RunMetadata::new(id, OffsetDateTime::now_utc());
        let mut handles = Vec::new();

        let started = Instant::now();
        if let Some(cmd) = &self.cfg.provision {
            let session = start_local(cmd, "provisioning").await?;
            handles.push(drain_in_background(session, StageId::new("provision")));
        }
        meta.provisioning_secs = secs(started.elapsed());
        cooldown(self.cfg.cooldowns.after_provision).await;

        let nodes = match load_inventory(&self.cfg.provisioning_log_dir) {
            Ok(nodes) => nodes,
            Err(e) => {
                ctx.processes().teardown(&handles);
                return Err(e);
            }
        };
        info!(target: "fleet.runner.run", run = %id.file_stem(), nodes = nodes.len(), "inventory loaded");
        prepare_counter_dirs(&self.cfg.counter_root, &nodes);

        let res = self.measure(id, &nodes, &mut meta, &mut handles).await;

        let failed = ctx.processes().teardown(&handles);
        if failed > 0 {
            warn!(target: "fleet.runner.run", failed, "some processes could not be terminated");
        }
        if self.cfg.keep_vms {
            info!(target: "fleet.runner.run", "vms kept");
        } else {
            destroy_vms(&nodes).await;
        }
        res.map(|()| meta)
    }

    async fn measure(
        &self,
        id: &RunId,
        nodes: &[NodeTarget],
        meta: &mut RunMetadata,
        handles: &mut Vec<ProcessHandle>,
    ) -> Result<(), RunnerError> {
        let ctx = self.dispatcher.context();

        let started = Instant::now();
        if let Some(cmd) = &self.cfg.exporter {
            let session = start_local(cmd, "exporter").await?;
            handles.push(drain_in_background(session, StageId::new("host-exporter")));
        }
        meta.exporter_start_secs = secs(started.elapsed());
        cooldown(self.cfg.cooldowns.after_exporter).await;

        let started = Instant::now();
        let dispatch = self.dispatcher.dispatch(&id.experiment, nodes).await;
        meta.setup_secs = secs(started.elapsed());
        handles.extend(dispatch.handles());
        meta.failed_nodes = dispatch.failures().map(|o| o.node.to_string()).collect();
        for o in dispatch.failures() {
            if let Some((stage, e)) = &o.failure {
                warn!(target: "fleet.runner.run", node = %o.node, %stage, error = %e, "node setup failed");
            }
        }
        if dispatch.is_fatal() {
            return Err(RunnerError::Aborted(format!(
                "{} could not reach a node",
                id.experiment
            )));
        }
        cooldown(self.cfg.cooldowns.after_setup).await;

        let controller = nodes.first().ok_or_else(|| {
            RunnerError::EmptyInventory(self.cfg.provisioning_log_dir.clone())
        })?;
        if self.cfg.workload {
            let handle = Workload::new(&self.cfg.stages).run(controller, None, ctx).await?;
            handles.push(handle);
        }

        let stop_disruption = self.shutdown.child_token();
        let disruption = self.cfg.disruption.then(|| {
            tokio::spawn(Disruption::new(&self.cfg.stages).run(
                Arc::clone(ctx),
                controller.clone(),
                stop_disruption.clone(),
            ))
        });

        let started = Instant::now();
        let sampled = self.sample(id, nodes).await;
        meta.sampling_secs = secs(started.elapsed());

        stop_disruption.cancel();
        if let Some(task) = disruption {
            match task.await {
                Ok(Ok(killed)) => info!(target: "fleet.runner.run", killed, "disruption joined"),
                Ok(Err(e)) => warn!(target: "fleet.runner.run", error = %e, "disruption failed"),
                Err(e) => warn!(target: "fleet.runner.run", error = %e, "disruption task crashed"),
            }
        }

        let stats = sampled?;
        meta.samples = stats.total;
        meta.vms_experiment = nodes.len();
        meta.vms_active = match process_table().await {
            Ok(ps) => active_vm_count(&ps, &self.cfg.vm_owner),
            Err(e) => {
                warn!(target: "fleet.runner.run", error = %e, "active vm count unavailable");
                0
            }
        };
        meta.write(&id.metadata_path(&self.cfg.results_dir))?;
        Ok(())
    }

    async fn sample(&self, id: &RunId, nodes: &[NodeTarget]) -> Result<SamplerStats, RunnerError> {
        let ps = process_table().await?;
        let names: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let pids = vm_pids(&ps, &self.cfg.vm_owner, &names)?;

        let probes = nodes
            .iter()
            .zip(pids)
            .map(|(n, pid)| NodeProbe::for_vm(n.id.clone(), pid, &self.cfg.counter_root))
            .collect();
        let sampler = Sampler::new(self.cfg.sampler_config(), probes)?;
        sampler.wait_ready().await?;

        let mut log = SampleLog::create(id.samples_path(&self.cfg.results_dir))?;
        info!(
            target: "fleet.runner.run",
            run = %id.file_stem(),
            duration_s = self.cfg.measure_interval,
            "measurement started"
        );
        let stats = sampler.run_until(&mut log, &self.shutdown).await?;
        info!(
            target: "fleet.runner.run",
            samples = stats.total,
            skipped = stats.skipped,
            max_gap_ms = stats.max_gap.as_millis() as u64,
            "measurement finished"
        );
        Ok(stats)
    }
}

async fn cooldown(secs: u64) {
    if secs > 0 {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cooldowns;
    use fleet_session::testing::{ScriptedConnector, ScriptedTransport};

    fn controller(cfg: RunnerConfig) -> RunController {
        let connector = ScriptedConnector::new(|_| Ok(ScriptedTransport::new().close_when_idle()));
        RunController::new(cfg, Arc::new(connector), CancellationToken::new()).unwrap()
    }

    fn quiet(dir: &std::path::Path) -> RunnerConfig {
        RunnerConfig {
            results_dir: dir.join("res"),
            provisioning_log_dir: dir.join("logs"),
            counter_root: dir.join("counters"),
            experiments: vec!["qemu".into()],
            runs: 2,
            measure_interval: 60,
            keep_vms: true,
            cooldowns: Cooldowns {
                after_provision: 0,
                after_exporter: 0,
                after_setup: 0,
                between_runs: 0,
            },
            ..RunnerConfig::default()
        }
    }

    #[tokio::test]
    async fn finished_runs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = quiet(dir.path());
        for index in 0..2 {
            let id = RunId::new("qemu", index, 60);
            std::fs::create_dir_all(id.dir(&cfg.results_dir)).unwrap();
            std::fs::write(id.metadata_path(&cfg.results_dir), "{}").unwrap();
        }

        let summary = controller(cfg).run_all().await;
        assert_eq!(
            summary,
            CampaignSummary {
                completed: 0,
                skipped: 2,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn missing_inventory_fails_each_run() {
        let dir = tempfile::tempdir().unwrap();
        let summary = controller(quiet(dir.path())).run_all().await;
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.completed, 0);
    }

    #[tokio::test]
    async fn cancelled_campaign_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new(|_| Ok(ScriptedTransport::new()));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let c = RunController::new(quiet(dir.path()), Arc::new(connector), shutdown).unwrap();
        assert_eq!(c.run_all().await, CampaignSummary::default());
    }

    #[test]
    fn plan_file_extends_builtin_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plans.json");
        std::fs::write(&path, r#"{ "custom": { "mode": "parallel", "everyNode": [ { "stage": "system-update" } ] } }"#)
            .unwrap();
        let cfg = RunnerConfig {
            plan_table: Some(path),
            ..quiet(dir.path())
        };
        let c = controller(cfg);
        assert!(c.dispatcher.table().get("custom").is_some());
        assert!(c.dispatcher.table().get("kube_sca").is_some());
    }
}
