mod node;
pub use node::{NodeId, NodeTarget};

mod stage;
pub use stage::{ExecutionMode, StageArg, StageDescriptor, StageId};

mod condition;
pub use condition::{Condition, ConditionSet, ConditionStatus};

mod process;
pub use process::ProcessHandle;

mod sample;
pub use sample::{Fingerprint, Sample};

/// Index of a node inside a run (position in the inventory).
///
/// Node `0` is the controller node: stages that target the whole cluster
/// (helm charts, schedulers, workloads) are planned there.
pub type NodeIndex = usize;

/// Per-node sequence index of a sample.
pub type SeqIndex = u64;

/// Index of the node that carries cluster-wide stages.
pub const CONTROLLER_NODE: NodeIndex = 0;
