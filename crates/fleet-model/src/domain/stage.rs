use std::{borrow::Cow, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{ModelError, NodeIndex};

/// Identifier of a stage: a unit of remote configuration work on one node.
///
/// Well-known stages are exposed as associated constants; any other name is
/// accepted so that plan tables loaded from disk can reference stages
/// registered by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(Cow<'static, str>);

impl StageId {
    /// Remove unattended upgrades, then `apt update && apt upgrade`.
    pub const SYSTEM_UPDATE: StageId = StageId::from_static("system-update");
    /// Mount the host-shared virtiofs folder carrying the energy counters.
    pub const SHARED_MOUNT: StageId = StageId::from_static("shared-mount");
    /// Install the energy exporter helm chart (controller node).
    pub const ENERGY_EXPORTER: StageId = StageId::from_static("energy-exporter");
    /// Install the social-network microservice benchmark (controller node).
    pub const SOCIAL_NETWORK: StageId = StageId::from_static("social-network");
    /// Deploy the energy-aware scheduler (controller node).
    pub const ENERGY_SCHEDULER: StageId = StageId::from_static("energy-scheduler");
    /// Build and install the load generator.
    pub const LOAD_GENERATOR: StageId = StageId::from_static("load-generator");
    /// Spin CPUs directly on the guest.
    pub const HOST_CPU_BURN: StageId = StageId::from_static("host-cpu-burn");
    /// Spin CPUs through a pod deployment.
    pub const POD_CPU_BURN: StageId = StageId::from_static("pod-cpu-burn");
    /// Start the load generator against the benchmark frontend.
    pub const WORKLOAD: StageId = StageId::from_static("workload");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for StageId {
    fn from(s: &'static str) -> Self {
        Self::from_static(s)
    }
}

/// Optional argument handed to a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageArg {
    /// Boolean switch (e.g. "wait for readiness").
    Flag(bool),
    /// Numeric parameter (e.g. number of cores to burn).
    Count(u32),
    /// Free-form parameter.
    Text(String),
}

impl StageArg {
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            StageArg::Flag(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<u32> {
        match self {
            StageArg::Count(v) => Some(*v),
            StageArg::Text(s) => s.trim().parse().ok(),
            StageArg::Flag(_) => None,
        }
    }
}

/// One planned stage on one node. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDescriptor {
    pub stage: StageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<StageArg>,
    pub node: NodeIndex,
}

impl StageDescriptor {
    pub fn new(stage: StageId, arg: Option<StageArg>, node: NodeIndex) -> Self {
        Self { stage, arg, node }
    }
}

/// How the per-node plans of a run configuration are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionMode {
    /// One worker per node; node plans run concurrently.
    Parallel,
    /// Node plans run one after another on the calling task.
    #[default]
    Sequential,
}

impl FromStr for ExecutionMode {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(ExecutionMode::Parallel),
            "sequential" => Ok(ExecutionMode::Sequential),
            _ => Err(ModelError::UnknownMode(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_and_custom_ids_compare_by_name() {
        assert_eq!(StageId::new("system-update"), StageId::SYSTEM_UPDATE);
        assert_ne!(StageId::new("custom"), StageId::WORKLOAD);
    }

    #[test]
    fn stage_arg_untagged_json() {
        let args: Vec<StageArg> = serde_json::from_str(r#"[true, 4, "8"]"#).unwrap();
        assert_eq!(args[0].as_flag(), Some(true));
        assert_eq!(args[1].as_count(), Some(4));
        assert_eq!(args[2].as_count(), Some(8));
        assert_eq!(args[0].as_count(), None);
    }

    #[test]
    fn descriptor_omits_missing_arg() {
        let d = StageDescriptor::new(StageId::SHARED_MOUNT, None, 2);
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, r#"{"stage":"shared-mount","node":2}"#);
    }

    #[test]
    fn execution_mode_parse() {
        assert_eq!(
            "Parallel".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::Parallel
        );
        assert!("both".parse::<ExecutionMode>().is_err());
    }
}
