//! Executes run plans across the node inventory.
use std::{sync::Arc, time::Instant};

use fleet_model::{ExecutionMode, NodeId, NodeIndex, NodeTarget, ProcessHandle, StageDescriptor, StageId};
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::{
    context::RunContext,
    error::{DispatchError, StageError},
    plan::{PlanTable, RunPlan},
    stage::StageRouter,
};

/// What one node's worker did.
#[derive(Debug)]
pub struct NodeOutcome {
    pub index: NodeIndex,
    pub node: NodeId,
    /// Stages that finished, in execution order.
    pub completed: Vec<StageId>,
    /// Handles returned by completed stages, tracked or not.
    pub handles: Vec<ProcessHandle>,
    /// Stage that stopped this node's plan.
    pub failure: Option<(StageId, StageError)>,
}

impl NodeOutcome {
    fn new(target: &NodeTarget) -> Self {
        Self {
            index: target.index,
            node: target.id.clone(),
            completed: Vec::new(),
            handles: Vec::new(),
            failure: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

/// Result of [`Dispatcher::dispatch`].
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Outcomes ordered by node index; nodes never started are absent.
    pub outcomes: Vec<NodeOutcome>,
    /// A sequential run stopped at its first failing node.
    pub aborted: bool,
}

impl Dispatch {
    /// Tracked handles of every node, in node order.
    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.outcomes
            .iter()
            .flat_map(|o| o.handles.iter())
            .filter(|h| h.is_tracked())
            .cloned()
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    /// An aborted sequential run whose cause was an unreachable node.
    pub fn is_fatal(&self) -> bool {
        self.aborted
            && self
                .failures()
                .any(|o| matches!(&o.failure, Some((_, e)) if e.is_connection()))
    }
}

/// Resolves run configurations and drives their stages on the nodes.
pub struct Dispatcher {
    table: PlanTable,
    router: StageRouter,
    ctx: Arc<RunContext>,
}

impl Dispatcher {
    pub fn new(table: PlanTable, router: StageRouter, ctx: Arc<RunContext>) -> Self {
        Self { table, router, ctx }
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    pub fn table(&self) -> &PlanTable {
        &self.table
    }

    /// Run configuration `name` on `nodes`.
    ///
    /// Unknown configurations are logged and yield an empty dispatch.
    #[instrument(level = "debug", skip(self, nodes), fields(nodes = nodes.len()))]
    pub async fn dispatch(&self, name: &str, nodes: &[NodeTarget]) -> Dispatch {
        let plan = match self.table.resolve(name, nodes.len()) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(target: "fleet.dispatch", error = %e, "nothing to run");
                return Dispatch::default();
            }
        };
        info!(
            target: "fleet.dispatch",
            plan = %plan.name,
            mode = ?plan.mode,
            nodes = plan.node_count(),
            stages = plan.stage_count(),
            "dispatch started"
        );

        let started = Instant::now();
        let dispatch = match plan.mode {
            ExecutionMode::Parallel => self.run_parallel(plan, nodes).await,
            ExecutionMode::Sequential => self.run_sequential(plan, nodes).await,
        };

        let failed = dispatch.failures().count();
        info!(
            target: "fleet.dispatch",
            handles = dispatch.handles().len(),
            failed,
            aborted = dispatch.aborted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dispatch finished"
        );
        dispatch
    }

    async fn run_parallel(&self, plan: RunPlan, nodes: &[NodeTarget]) -> Dispatch {
        let mut workers = JoinSet::new();
        for (target, stages) in nodes.iter().cloned().zip(plan.per_node) {
            let router = self.router.clone();
            let ctx = Arc::clone(&self.ctx);
            workers.spawn(async move { run_node(&router, &ctx, &target, &stages).await });
        }

        let mut outcomes = Vec::with_capacity(nodes.len());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(target: "fleet.dispatch", error = %e, "node worker crashed"),
            }
        }

        // A crashed worker leaves no outcome; report it as a failed node.
        for target in nodes {
            if !outcomes.iter().any(|o| o.index == target.index) {
                let mut lost = NodeOutcome::new(target);
                lost.failure = Some((
                    StageId::from_static("worker"),
                    StageError::Failed(DispatchError::Worker(target.id.to_string()).to_string()),
                ));
                outcomes.push(lost);
            }
        }
        outcomes.sort_by_key(|o| o.index);
        Dispatch {
            outcomes,
            aborted: false,
        }
    }

    async fn run_sequential(&self, plan: RunPlan, nodes: &[NodeTarget]) -> Dispatch {
        let mut dispatch = Dispatch::default();
        for (target, stages) in nodes.iter().zip(plan.per_node.iter()) {
            let outcome = run_node(&self.router, &self.ctx, target, stages).await;
            let failed = !outcome.is_ok();
            dispatch.outcomes.push(outcome);
            if failed {
                error!(target: "fleet.dispatch", node = %target.id, "sequential run aborted");
                dispatch.aborted = true;
                break;
            }
        }
        dispatch
    }
}

async fn run_node(
    router: &StageRouter,
    ctx: &RunContext,
    target: &NodeTarget,
    stages: &[StageDescriptor],
) -> NodeOutcome {
    let mut outcome = NodeOutcome::new(target);
    for desc in stages {
        let started = Instant::now();
        info!(target: "fleet.dispatch.stage", node = %target.id, stage = %desc.stage, "stage started");

        let res = match router.pick(&desc.stage) {
            Some(stage) => stage.run(target, desc.arg.as_ref(), ctx).await,
            None => Err(StageError::Unregistered(desc.stage.clone())),
        };
        match res {
            Ok(handle) => {
                info!(
                    target: "fleet.dispatch.stage",
                    node = %target.id,
                    stage = %desc.stage,
                    pid = handle.pid,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "stage finished"
                );
                outcome.completed.push(desc.stage.clone());
                outcome.handles.push(handle);
            }
            Err(e) => {
                error!(
                    target: "fleet.dispatch.stage",
                    node = %target.id,
                    stage = %desc.stage,
                    error = %e,
                    "stage failed; skipping the rest of this node"
                );
                outcome.failure = Some((desc.stage.clone(), e));
                break;
            }
        }
    }
    outcome
}
