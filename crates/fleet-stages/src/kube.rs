//! Cluster-wide installs driven from the controller node.
use async_trait::async_trait;
use fleet_core::{KubePodQuery, RunContext, Stage, StageError};
use fleet_model::{NodeTarget, ProcessHandle, StageArg, StageId};
use fleet_session::Session;
use tokio::time::sleep;
use tracing::info;

use crate::{
    StageSettings,
    util::{SETTLE, adopt_or_close, await_pods, finish, wait_flag},
};

/// Energy exporter helm chart.
///
/// The installing shell stays open until teardown.
#[derive(Debug, Clone)]
pub struct EnergyExporter {
    version: String,
}

impl EnergyExporter {
    pub fn new(settings: &StageSettings) -> Self {
        Self {
            version: settings.exporter_version.clone(),
        }
    }

    async fn drive(&self, session: &mut Session, ctx: &RunContext, wait: bool) -> Result<(), StageError> {
        session.sync_barrier_within(ctx.timeouts().start).await?;
        session
            .submit(&format!(
                "git clone --depth 1 --branch {} https://github.com/hubblo-org/scaphandre.git",
                self.version
            ))
            .await?;
        session.submit("sudo snap install helm --classic").await?;
        session.sync_barrier_within(ctx.timeouts().install).await?;

        session.submit("cd scaphandre").await?;
        let assets = ctx.assets();
        session
            .write_remote_file("helm/scaphandre/values.yaml", &assets.read("scaphandre/values.yaml").await)
            .await?;
        session
            .write_remote_file(
                "helm/scaphandre/templates/daemonset.yaml",
                &assets.read("scaphandre/daemonset.yaml").await,
            )
            .await?;
        session.submit("helm install scaphandre helm/scaphandre").await?;
        info!(target: "fleet.stages.exporter", node = %session.node(), version = %self.version, "exporter chart installed");

        if wait {
            await_pods(ctx, session, &["scaphandre".to_string()], KubePodQuery::namespace("default")).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for EnergyExporter {
    fn id(&self) -> StageId {
        StageId::ENERGY_EXPORTER
    }

    async fn run(
        &self,
        target: &NodeTarget,
        arg: Option<&StageArg>,
        ctx: &RunContext,
    ) -> Result<ProcessHandle, StageError> {
        let mut session = ctx.open(target).await?;
        let res = self.drive(&mut session, ctx, wait_flag(arg)).await;
        let handle = adopt_or_close(ctx, self.id(), session, res)?;
        // Lets exporter instances on the other nodes catch up.
        sleep(SETTLE).await;
        Ok(handle)
    }
}

/// Social-network microservice benchmark chart.
#[derive(Debug, Clone)]
pub struct SocialNetwork {
    version: String,
    pods: Vec<String>,
}

impl SocialNetwork {
    const CHART: &'static str = "./DeathStarBench/socialNetwork/helm-chart/socialnetwork";

    pub fn new(settings: &StageSettings) -> Self {
        Self {
            version: settings.benchmark_version.clone(),
            pods: settings.benchmark_pods.clone(),
        }
    }

    async fn drive(&self, session: &mut Session, ctx: &RunContext, wait: bool) -> Result<(), StageError> {
        session
            .submit(&format!(
                "git clone --depth 1 --branch {} https://github.com/delimitrou/DeathStarBench.git",
                self.version
            ))
            .await?;
        session.submit("sudo snap install helm --classic").await?;
        session.sync_barrier_within(ctx.timeouts().install).await?;

        let assets = ctx.assets();
        session
            .write_remote_file(&format!("{}/values.yaml", Self::CHART), &assets.read("dsb/values.yaml").await)
            .await?;
        for pod in &self.pods {
            let content = assets.read(&format!("dsb/{pod}/values.yaml")).await;
            session
                .write_remote_file(&format!("{}/charts/{pod}/values.yaml", Self::CHART), &content)
                .await?;
        }
        session.submit(&format!("helm install dsb {}", Self::CHART)).await?;
        info!(target: "fleet.stages.benchmark", node = %session.node(), pods = self.pods.len(), "benchmark chart installed");

        if wait {
            await_pods(ctx, session, &self.pods, KubePodQuery::namespace("default")).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for SocialNetwork {
    fn id(&self) -> StageId {
        StageId::SOCIAL_NETWORK
    }

    async fn run(
        &self,
        target: &NodeTarget,
        arg: Option<&StageArg>,
        ctx: &RunContext,
    ) -> Result<ProcessHandle, StageError> {
        let mut session = ctx.open(target).await?;
        let res = self.drive(&mut session, ctx, wait_flag(arg)).await;
        finish(session, self.id(), res)
    }
}

/// Energy-aware scheduler, fed by a prometheus port-forward.
#[derive(Debug, Clone)]
pub struct EnergyScheduler {
    prometheus_address: Option<String>,
}

impl EnergyScheduler {
    pub fn new(settings: &StageSettings) -> Self {
        Self {
            prometheus_address: settings.prometheus_address.clone(),
        }
    }

    fn port_forward(&self) -> String {
        let address = self
            .prometheus_address
            .as_deref()
            .map(|a| format!(" --address={a}"))
            .unwrap_or_default();
        format!(
            "nohup kubectl port-forward --namespace=monitoring{address} svc/prometheus-k8s 9090:9090 > /dev/null 2>&1 &"
        )
    }

    async fn drive(&self, session: &mut Session, ctx: &RunContext, wait: bool) -> Result<(), StageError> {
        session.submit(&self.port_forward()).await?;
        session
            .write_remote_file("scheduler.yaml", &ctx.assets().read("scheduler/values.yaml").await)
            .await?;
        session.submit("kubectl create -f scheduler.yaml").await?;
        if wait {
            await_pods(ctx, session, &["escheduler".to_string()], KubePodQuery::namespace("kube-system")).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for EnergyScheduler {
    fn id(&self) -> StageId {
        StageId::ENERGY_SCHEDULER
    }

    async fn run(
        &self,
        target: &NodeTarget,
        arg: Option<&StageArg>,
        ctx: &RunContext,
    ) -> Result<ProcessHandle, StageError> {
        let mut session = ctx.open(target).await?;
        let res = self.drive(&mut session, ctx, wait_flag(arg)).await;
        finish(session, self.id(), res)
    }
}

/// CPU burn deployed as pods; the scheduler decides where they land.
#[derive(Debug, Default, Clone, Copy)]
pub struct PodCpuBurn;

impl PodCpuBurn {
    async fn drive(&self, session: &mut Session, ctx: &RunContext, wait: bool) -> Result<(), StageError> {
        session
            .write_remote_file("pod.yaml", &ctx.assets().read("cpu_load/values.yaml").await)
            .await?;
        session.submit("kubectl create -f pod.yaml").await?;
        if wait {
            await_pods(ctx, session, &["block-cpu".to_string()], KubePodQuery::namespace("default")).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for PodCpuBurn {
    fn id(&self) -> StageId {
        StageId::POD_CPU_BURN
    }

    async fn run(
        &self,
        target: &NodeTarget,
        arg: Option<&StageArg>,
        ctx: &RunContext,
    ) -> Result<ProcessHandle, StageError> {
        let mut session = ctx.open(target).await?;
        let res = self.drive(&mut session, ctx, wait_flag(arg)).await;
        adopt_or_close(ctx, self.id(), session, res)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use fleet_core::{Assets, StageTimeouts};
    use fleet_session::testing::{ScriptHandle, ScriptedConnector, ScriptedTransport};

    fn context(
        assets: &std::path::Path,
        script: fn() -> ScriptedTransport,
    ) -> (RunContext, Arc<Mutex<Vec<ScriptHandle>>>) {
        let handles = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&handles);
        let connector = ScriptedConnector::new(move |_| {
            let t = script();
            sink.lock().unwrap().push(t.handle());
            Ok(t)
        });
        let ctx = RunContext::new(Arc::new(connector))
            .with_assets(Assets::new(assets))
            .with_timeouts(StageTimeouts {
                readiness: Duration::from_secs(30),
                ..StageTimeouts::default()
            });
        (ctx, handles)
    }

    fn controller() -> NodeTarget {
        NodeTarget::new(0, "cloud_controller", "192.168.221.2")
    }

    #[tokio::test(start_paused = true)]
    async fn exporter_is_adopted_after_readiness() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scaphandre")).unwrap();
        std::fs::write(dir.path().join("scaphandre/values.yaml"), "port: 8080").unwrap();
        let (ctx, scripts) = context(dir.path(), || {
            ScriptedTransport::new()
                .with_pid(900)
                .on("kubectl wait", ["pod/scaphandre-x7 condition met"])
        });

        let handle = EnergyExporter::new(&StageSettings::default())
            .run(&controller(), Some(&StageArg::Flag(true)), &ctx)
            .await
            .unwrap();

        assert_eq!(handle.pid, 900);
        assert!(ctx.processes().contains(900));
        let script = &scripts.lock().unwrap()[0];
        let sent = script.sent();
        assert!(sent.iter().any(|l| l.contains("--branch v1.0.0")));
        assert!(sent.contains(&r#"echo "port: 8080" > "helm/scaphandre/values.yaml""#.to_string()));
        // Missing daemonset asset leaves the remote file alone.
        assert!(!sent.iter().any(|l| l.contains("daemonset.yaml")));
        assert_eq!(script.terminations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_waits_in_kube_system_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, scripts) = context(dir.path(), || {
            ScriptedTransport::new().on("kubectl wait", ["pod/escheduler-5d condition met"])
        });

        let handle = EnergyScheduler::new(&StageSettings::default())
            .run(&controller(), None, &ctx)
            .await
            .unwrap();

        assert!(!handle.is_tracked());
        let script = &scripts.lock().unwrap()[0];
        let sent = script.sent();
        assert!(sent[0].contains("--address=192.168.221.2 svc/prometheus-k8s 9090:9090"));
        assert!(sent.iter().any(|l| l.contains("kubectl wait pod --all -n kube-system")));
        assert_eq!(script.terminations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn benchmark_without_wait_skips_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, scripts) = context(dir.path(), ScriptedTransport::new);

        SocialNetwork::new(&StageSettings::default())
            .run(&controller(), Some(&StageArg::Flag(false)), &ctx)
            .await
            .unwrap();

        let sent = scripts.lock().unwrap()[0].sent();
        assert!(sent.iter().any(|l| l.starts_with("helm install dsb ")));
        assert!(!sent.iter().any(|l| l.contains("kubectl wait")));
    }

    #[tokio::test(start_paused = true)]
    async fn pod_burn_timeout_degrades_but_keeps_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(dir.path(), || ScriptedTransport::new().with_pid(31));

        let handle = PodCpuBurn.run(&controller(), None, &ctx).await.unwrap();
        assert_eq!(handle.pid, 31);
    }
}
