use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use fleet_model::{NodeTarget, ProcessHandle, StageId};
use fleet_session::{Connector, Session};
use tracing::{debug, warn};

use crate::{conditions::ConditionTracker, error::StageError, processes::ProcessTable};

/// Bounds applied by stages while they drive remote shells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    /// Overall budget for one readiness wait (all conditions together).
    pub readiness: Duration,
    /// Long-running remote commands (package upgrades, image builds).
    pub install: Duration,
    /// Start-up line of a background process.
    pub start: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            readiness: Duration::from_secs(600),
            install: Duration::from_secs(1800),
            start: Duration::from_secs(60),
        }
    }
}

/// Local directory with files that stages copy to nodes.
#[derive(Debug, Clone, Default)]
pub struct Assets {
    root: PathBuf,
}

impl Assets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Contents of `rel`, or an empty string when it cannot be read.
    ///
    /// Writing empty content to a node is a no-op, so a missing asset
    /// degrades into "leave the remote file as it is".
    pub async fn read(&self, rel: &str) -> String {
        let path = self.path(rel);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(target: "fleet.assets", path = %path.display(), error = %e, "asset unreadable");
                String::new()
            }
        }
    }
}

/// Everything a stage needs besides its target node.
///
/// Shared by all node workers of a dispatch.
pub struct RunContext {
    connector: Arc<dyn Connector>,
    processes: ProcessTable,
    timeouts: StageTimeouts,
    tracker: ConditionTracker,
    assets: Assets,
}

impl RunContext {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            processes: ProcessTable::new(),
            timeouts: StageTimeouts::default(),
            tracker: ConditionTracker::default(),
            assets: Assets::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_tracker(mut self, tracker: ConditionTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_assets(mut self, assets: Assets) -> Self {
        self.assets = assets;
        self
    }

    /// Open a fresh remote shell on `target`.
    pub async fn open(&self, target: &NodeTarget) -> Result<Session, StageError> {
        let session = self.connector.open(target).await?;
        debug!(target: "fleet.context", node = %target.id, pid = ?session.pid(), "session opened");
        Ok(session)
    }

    /// Keep `session` alive past the stage and return its teardown handle.
    pub fn adopt(&self, stage: StageId, session: Session) -> ProcessHandle {
        self.processes.adopt(stage, session)
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn timeouts(&self) -> &StageTimeouts {
        &self.timeouts
    }

    pub fn tracker(&self) -> &ConditionTracker {
        &self.tracker
    }

    pub fn assets(&self) -> &Assets {
        &self.assets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_session::testing::{ScriptedConnector, ScriptedTransport};

    #[tokio::test]
    async fn missing_asset_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("values.yaml"), "replicas: 1\n").unwrap();
        let assets = Assets::new(dir.path());

        assert_eq!(assets.read("values.yaml").await, "replicas: 1\n");
        assert_eq!(assets.read("absent.yaml").await, "");
    }

    #[tokio::test]
    async fn adopted_sessions_land_in_the_shared_table() {
        let connector = ScriptedConnector::new(|_| Ok(ScriptedTransport::new().with_pid(77)));
        let ctx = RunContext::new(Arc::new(connector));
        let target = NodeTarget::new(0, "cloud0", "10.0.0.2");

        let session = ctx.open(&target).await.unwrap();
        let handle = ctx.adopt(StageId::ENERGY_EXPORTER, session);

        assert_eq!(handle.pid, 77);
        assert!(ctx.processes().contains(77));
    }
}
