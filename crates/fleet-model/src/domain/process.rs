use serde::{Deserialize, Serialize};

use crate::{NodeId, StageId};

/// Background process started by a stage, kept for teardown.
///
/// `pid` is the local process (group) id of the remote-shell proxy.
/// A value `<= 0` means the stage left nothing running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandle {
    pub node: NodeId,
    pub stage: StageId,
    pub pid: i32,
}

impl ProcessHandle {
    pub fn new(node: NodeId, stage: StageId, pid: i32) -> Self {
        Self { node, stage, pid }
    }

    /// Handle for a stage that finished without leaving a process behind.
    pub fn none(node: NodeId, stage: StageId) -> Self {
        Self { node, stage, pid: -1 }
    }

    /// Returns `true` if there is a process to terminate at teardown.
    #[inline]
    pub fn is_tracked(&self) -> bool {
        self.pid > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_positive_pids_are_tracked() {
        let node = NodeId::from("cloud0");
        assert!(!ProcessHandle::none(node.clone(), StageId::SYSTEM_UPDATE).is_tracked());
        assert!(!ProcessHandle::new(node.clone(), StageId::WORKLOAD, 0).is_tracked());
        assert!(ProcessHandle::new(node, StageId::WORKLOAD, 4242).is_tracked());
    }
}
