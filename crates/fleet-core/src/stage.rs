use std::sync::Arc;

use async_trait::async_trait;
use fleet_model::{NodeTarget, ProcessHandle, StageArg, StageId};
use tracing::trace;

use crate::{context::RunContext, error::StageError};

/// One unit of remote configuration work.
///
/// A stage opens its own sessions through the [`RunContext`]. Stages that
/// leave a process running hand its session to [`RunContext::adopt`] and
/// return the resulting handle; all others return [`ProcessHandle::none`].
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    async fn run(
        &self,
        target: &NodeTarget,
        arg: Option<&StageArg>,
        ctx: &RunContext,
    ) -> Result<ProcessHandle, StageError>;
}

/// Registry resolving stage ids to implementations.
#[derive(Default, Clone)]
pub struct StageRouter {
    stages: Vec<Arc<dyn Stage>>,
}

impl StageRouter {
    #[inline]
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Register `stage`; a later registration for the same id wins.
    #[inline]
    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        let id = stage.id();
        self.stages.retain(|s| s.id() != id);
        trace!(target: "fleet.router", stage = %id, "stage registered");
        self.stages.push(stage);
    }

    pub fn pick(&self, id: &StageId) -> Option<&Arc<dyn Stage>> {
        self.stages.iter().find(|s| &s.id() == id)
    }

    pub fn ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, i32);

    #[async_trait]
    impl Stage for Named {
        fn id(&self) -> StageId {
            StageId::from_static(self.0)
        }

        async fn run(
            &self,
            target: &NodeTarget,
            _arg: Option<&StageArg>,
            _ctx: &RunContext,
        ) -> Result<ProcessHandle, StageError> {
            Ok(ProcessHandle::new(target.id.clone(), self.id(), self.1))
        }
    }

    #[test]
    fn pick_finds_by_id_and_reregistration_replaces() {
        let mut router = StageRouter::new();
        router.register(Arc::new(Named("system-update", 1)));
        router.register(Arc::new(Named("workload", 2)));
        router.register(Arc::new(Named("workload", 3)));

        assert_eq!(router.len(), 2);
        assert!(router.pick(&StageId::SYSTEM_UPDATE).is_some());
        assert!(router.pick(&StageId::SHARED_MOUNT).is_none());
        assert_eq!(router.ids(), vec![StageId::SYSTEM_UPDATE, StageId::WORKLOAD]);
    }
}
