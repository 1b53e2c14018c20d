//! Run configurations as data.
//!
//! A [`PlanTemplate`] names the stages every node runs plus the cluster-wide
//! stages appended on the controller node; [`PlanTemplate::expand`] turns it
//! into a [`RunPlan`] for a concrete node count.
use std::{collections::BTreeMap, path::Path};

use fleet_model::{CONTROLLER_NODE, ExecutionMode, StageArg, StageDescriptor, StageId};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, PlanError};

/// Stage reference inside a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStage {
    pub stage: StageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<StageArg>,
}

impl PlannedStage {
    pub fn new(stage: StageId) -> Self {
        Self { stage, arg: None }
    }

    pub fn with_arg(stage: StageId, arg: StageArg) -> Self {
        Self {
            stage,
            arg: Some(arg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanTemplate {
    pub mode: ExecutionMode,
    /// Stages run on every node, in order.
    pub every_node: Vec<PlannedStage>,
    /// Stages appended on the controller node after `every_node`.
    pub controller: Vec<PlannedStage>,
}

impl PlanTemplate {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn every_node(mut self, stage: PlannedStage) -> Self {
        self.every_node.push(stage);
        self
    }

    pub fn controller(mut self, stage: PlannedStage) -> Self {
        self.controller.push(stage);
        self
    }

    /// Per-node descriptor lists for `nodes` nodes.
    pub fn expand(&self, name: &str, nodes: usize) -> RunPlan {
        let per_node = (0..nodes)
            .map(|index| {
                let extra: &[PlannedStage] = if index == CONTROLLER_NODE {
                    self.controller.as_slice()
                } else {
                    &[]
                };
                self.every_node
                    .iter()
                    .chain(extra)
                    .map(|p| StageDescriptor::new(p.stage.clone(), p.arg.clone(), index))
                    .collect()
            })
            .collect();
        RunPlan {
            name: name.to_string(),
            mode: self.mode,
            per_node,
        }
    }
}

/// A template expanded for a node count. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub name: String,
    pub mode: ExecutionMode,
    /// `per_node[i]` is the ordered stage list of node `i`.
    pub per_node: Vec<Vec<StageDescriptor>>,
}

impl RunPlan {
    pub fn node_count(&self) -> usize {
        self.per_node.len()
    }

    pub fn stage_count(&self) -> usize {
        self.per_node.iter().map(Vec::len).sum()
    }
}

/// Named run configurations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanTable {
    templates: BTreeMap<String, PlanTemplate>,
}

impl PlanTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configurations of the energy measurement campaign.
    pub fn builtin() -> Self {
        use ExecutionMode::{Parallel, Sequential};

        let update = || PlannedStage::new(StageId::SYSTEM_UPDATE);
        let mount = || PlannedStage::new(StageId::SHARED_MOUNT);
        let waiting = |stage: StageId| PlannedStage::with_arg(stage, StageArg::Flag(true));
        let updated = |mode| PlanTemplate::new(mode).every_node(update());
        let mounted = |mode| updated(mode).every_node(mount());

        let mut table = Self::new();
        for n in [1, 4, 8, 12, 16, 20] {
            table.insert(format!("baseline{n}"), updated(Sequential));
        }
        table.insert("qemu", updated(Parallel));
        table.insert("qemu_virtiofsd", mounted(Parallel));
        table.insert(
            "qemu_cpu100",
            mounted(Parallel).every_node(PlannedStage::new(StageId::HOST_CPU_BURN)),
        );
        table.insert("kube", updated(Parallel));
        table.insert("kube_prom", updated(Parallel));
        table.insert(
            "kube_cpu100",
            mounted(Parallel).controller(waiting(StageId::POD_CPU_BURN)),
        );
        table.insert(
            "kube_sca",
            mounted(Parallel).controller(waiting(StageId::ENERGY_EXPORTER)),
        );
        table.insert(
            "kube_sca_sched",
            mounted(Sequential)
                .controller(waiting(StageId::ENERGY_EXPORTER))
                .controller(waiting(StageId::ENERGY_SCHEDULER)),
        );
        table.insert(
            "kube_sca_dsb",
            mounted(Sequential)
                .controller(waiting(StageId::ENERGY_EXPORTER))
                .controller(waiting(StageId::SOCIAL_NETWORK)),
        );
        table.insert(
            "kube_sca_dsb_sched",
            mounted(Sequential)
                .controller(waiting(StageId::ENERGY_EXPORTER))
                .controller(waiting(StageId::ENERGY_SCHEDULER))
                .controller(waiting(StageId::SOCIAL_NETWORK)),
        );
        table.insert(
            "kube-scheduler",
            mounted(Sequential)
                .controller(waiting(StageId::ENERGY_EXPORTER))
                .controller(waiting(StageId::SOCIAL_NETWORK))
                .controller(PlannedStage::new(StageId::LOAD_GENERATOR)),
        );
        table.insert(
            "esched",
            mounted(Sequential)
                .controller(waiting(StageId::ENERGY_EXPORTER))
                .controller(waiting(StageId::ENERGY_SCHEDULER))
                .controller(waiting(StageId::SOCIAL_NETWORK))
                .controller(PlannedStage::new(StageId::LOAD_GENERATOR)),
        );
        table
    }

    pub fn from_json_str(raw: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let raw = std::fs::read_to_string(path).map_err(|e| PlanError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&raw)
    }

    pub fn insert(&mut self, name: impl Into<String>, template: PlanTemplate) {
        self.templates.insert(name.into(), template);
    }

    /// Add or replace the templates of `other`.
    pub fn merge(&mut self, other: PlanTable) {
        self.templates.extend(other.templates);
    }

    pub fn get(&self, name: &str) -> Option<&PlanTemplate> {
        self.templates.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Expand `name` for `nodes` nodes.
    ///
    /// An empty inventory resolves like an unknown name: there is nothing to run.
    pub fn resolve(&self, name: &str, nodes: usize) -> Result<RunPlan, DispatchError> {
        match self.templates.get(name) {
            Some(t) if nodes > 0 => Ok(t.expand(name, nodes)),
            _ => Err(DispatchError::UnknownConfiguration(name.to_string())),
        }
    }
}
