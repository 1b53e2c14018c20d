//! Stages that put load on the nodes.
use async_trait::async_trait;
use fleet_core::{RunContext, Stage, StageError};
use fleet_model::{NodeTarget, ProcessHandle, StageArg, StageId};
use fleet_session::{LineVerdict, Session};
use tracing::{info, warn};

use crate::{
    StageSettings, WorkloadSettings,
    util::{adopt_or_close, finish, tolerate_timeout},
};

/// Build and install the `wrk2` load generator shipped with the benchmark.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadGenerator;

impl LoadGenerator {
    const STEPS: [&'static str; 4] = [
        "cd ./DeathStarBench/wrk2",
        "cd deps && rm -r luajit && git clone https://github.com/LuaJIT/LuaJIT.git && cd LuaJIT && git reset --hard 2090842410e0ba6f81fad310a77bf5432488249a && cd .. && mv LuaJIT/ luajit/ && cd ..",
        "make -j",
        "sudo make install",
    ];

    async fn drive(&self, session: &mut Session, ctx: &RunContext) -> Result<(), StageError> {
        let install = ctx.timeouts().install;
        session
            .submit("sudo apt-get install -y libssl-dev libz-dev luarocks make && sudo luarocks install luasocket")
            .await?;
        session.sync_barrier_within(install).await?;
        for step in Self::STEPS {
            session.submit(step).await?;
        }
        session.sync_barrier_within(install).await?;
        session.submit("cd ~").await?;
        info!(target: "fleet.stages.loadgen", node = %session.node(), "load generator installed");
        Ok(())
    }
}

#[async_trait]
impl Stage for LoadGenerator {
    fn id(&self) -> StageId {
        StageId::LOAD_GENERATOR
    }

    async fn run(
        &self,
        target: &NodeTarget,
        _arg: Option<&StageArg>,
        ctx: &RunContext,
    ) -> Result<ProcessHandle, StageError> {
        let mut session = ctx.open(target).await?;
        let res = self.drive(&mut session, ctx).await;
        finish(session, self.id(), res)
    }
}

/// Spin guest CPUs with the burner binary from the shared folder.
#[derive(Debug, Clone)]
pub struct HostCpuBurn {
    binary: String,
    default_cores: u32,
}

impl HostCpuBurn {
    pub fn new(settings: &StageSettings) -> Self {
        Self {
            binary: settings.burn_binary.clone(),
            default_cores: settings.burn_cores,
        }
    }

    async fn drive(&self, session: &mut Session, ctx: &RunContext, cores: u32) -> Result<(), StageError> {
        session.submit(&format!("{} -n {cores}", self.binary)).await?;
        let res = session
            .expect_line(&["Blocking"], &["No such file", "not found"], ctx.timeouts().start)
            .await;
        match tolerate_timeout(res, session, "burner start-up")? {
            Some((LineVerdict::Matched, _)) => {
                info!(target: "fleet.stages.burn", node = %session.node(), cores, "cpu burn running")
            }
            Some((LineVerdict::Rejected, line)) => {
                return Err(StageError::Failed(format!("burner did not start: {line}")));
            }
            None => warn!(target: "fleet.stages.burn", node = %session.node(), "burner state unknown"),
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for HostCpuBurn {
    fn id(&self) -> StageId {
        StageId::HOST_CPU_BURN
    }

    async fn run(
        &self,
        target: &NodeTarget,
        arg: Option<&StageArg>,
        ctx: &RunContext,
    ) -> Result<ProcessHandle, StageError> {
        let cores = match arg {
            None => self.default_cores,
            Some(a) => a.as_count().ok_or_else(|| StageError::InvalidArgument {
                stage: self.id(),
                reason: format!("expected a core count, got {a:?}"),
            })?,
        };
        let mut session = ctx.open(target).await?;
        let res = self.drive(&mut session, ctx, cores).await;
        adopt_or_close(ctx, self.id(), session, res)
    }
}

/// Forward the benchmark frontend and start the load generator against it.
#[derive(Debug, Clone)]
pub struct Workload {
    settings: WorkloadSettings,
}

impl Workload {
    pub fn new(settings: &StageSettings) -> Self {
        Self {
            settings: settings.workload.clone(),
        }
    }

    async fn drive(&self, session: &mut Session, ctx: &RunContext) -> Result<(), StageError> {
        let s = &self.settings;
        session
            .submit(&format!(
                "nohup kubectl port-forward {} {} > /dev/null 2>&1 &",
                s.frontend, s.port
            ))
            .await?;
        session.sync_barrier_within(ctx.timeouts().start).await?;
        session.submit(&s.command()).await?;
        info!(
            target: "fleet.stages.workload",
            node = %session.node(),
            rate = s.requests_per_sec,
            duration_s = s.duration.as_secs(),
            "workload started"
        );
        Ok(())
    }
}

#[async_trait]
impl Stage for Workload {
    fn id(&self) -> StageId {
        StageId::WORKLOAD
    }

    async fn run(
        &self,
        target: &NodeTarget,
        _arg: Option<&StageArg>,
        ctx: &RunContext,
    ) -> Result<ProcessHandle, StageError> {
        let mut session = ctx.open(target).await?;
        let res = self.drive(&mut session, ctx).await;
        adopt_or_close(ctx, self.id(), session, res)
    }
}
