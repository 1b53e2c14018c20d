//! Guest preparation stages that run on every node.
use async_trait::async_trait;
use fleet_core::{RunContext, Stage, StageError};
use fleet_model::{NodeTarget, ProcessHandle, StageArg, StageId};
use fleet_session::{LineVerdict, Session};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::util::{SETTLE, finish, tolerate_timeout};

/// Drop unattended upgrades, then bring all packages up to date.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUpdate;

fn classify_upgrade(line: &str) -> Option<LineVerdict> {
    if line.contains("Failed to restart snapd") || line.contains("thread 'main' panicked") {
        Some(LineVerdict::Rejected)
    } else if line.contains("done") || (line.contains("upgraded") && line.contains("newly installed")) {
        Some(LineVerdict::Matched)
    } else {
        None
    }
}

impl SystemUpdate {
    async fn drive(&self, session: &mut Session, ctx: &RunContext) -> Result<(), StageError> {
        session.sync_barrier_within(ctx.timeouts().start).await?;
        session.submit("sudo apt remove unattended-upgrades -y").await?;
        session.submit("sudo apt update && sudo apt upgrade -y").await?;

        let res = session.wait_for(ctx.timeouts().install, classify_upgrade).await;
        match tolerate_timeout(res, session, "upgrade completion")? {
            Some((LineVerdict::Matched, _)) => {
                info!(target: "fleet.stages.update", node = %session.node(), "packages upgraded")
            }
            Some((LineVerdict::Rejected, line)) => warn!(
                target: "fleet.stages.update",
                node = %session.node(),
                %line,
                "upgrade reported a failure; continuing"
            ),
            None => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for SystemUpdate {
    fn id(&self) -> StageId {
        StageId::SYSTEM_UPDATE
    }

    async fn run(
        &self,
        target: &NodeTarget,
        _arg: Option<&StageArg>,
        ctx: &RunContext,
    ) -> Result<ProcessHandle, StageError> {
        let mut session = ctx.open(target).await?;
        let res = self.drive(&mut session, ctx).await;
        let handle = finish(session, self.id(), res)?;
        // Starting the next stage right after an upgrade trips over restarting services.
        sleep(SETTLE).await;
        Ok(handle)
    }
}

/// Mount the host-shared virtiofs folder and check that counters are visible.
#[derive(Debug, Clone)]
pub struct SharedMount {
    dir: String,
    tag: String,
}

impl SharedMount {
    pub fn new(dir: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            tag: tag.into(),
        }
    }

    async fn drive(&self, session: &mut Session, ctx: &RunContext) -> Result<(), StageError> {
        session.sync_barrier_within(ctx.timeouts().start).await?;
        session.submit(&format!("sudo mkdir {}", self.dir)).await?;
        session
            .submit(&format!("sudo mount -t virtiofs {} {}", self.tag, self.dir))
            .await?;
        session.submit(&format!("ls {}", self.dir)).await?;

        let res = session
            .expect_line(&["intel-rapl:0"], &[], ctx.timeouts().start)
            .await;
        if tolerate_timeout(res, session, "shared counter folder")?.is_some() {
            info!(target: "fleet.stages.mount", node = %session.node(), dir = %self.dir, "shared folder mounted");
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for SharedMount {
    fn id(&self) -> StageId {
        StageId::SHARED_MOUNT
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

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use fleet_session::testing::{ScriptHandle, ScriptedConnector, ScriptedTransport};

    fn context(script: fn() -> ScriptedTransport) -> (RunContext, Arc<Mutex<Vec<ScriptHandle>>>) {
        let handles = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&handles);
        let connector = ScriptedConnector::new(move |_| {
            let t = script();
            sink.lock().unwrap().push(t.handle());
            Ok(t)
        });
        (RunContext::new(Arc::new(connector)), handles)
    }

    fn target() -> NodeTarget {
        NodeTarget::new(1, "cloud1", "192.168.221.3")
    }

    #[test]
    fn upgrade_lines() {
        assert_eq!(
            classify_upgrade("0 upgraded, 0 newly installed, 0 to remove"),
            Some(LineVerdict::Matched)
        );
        assert_eq!(
            classify_upgrade("Failed to restart snapd.service: Unit not found"),
            Some(LineVerdict::Rejected)
        );
        assert_eq!(classify_upgrade("Reading package lists..."), None);
    }

    #[tokio::test(start_paused = true)]
    async fn update_runs_apt_and_closes_its_session() {
        let (ctx, scripts) = context(|| {
            ScriptedTransport::new().on(
                "apt upgrade",
                ["Reading package lists... Done", "3 upgraded, 0 newly installed"],
            )
        });

        let handle = SystemUpdate.run(&target(), None, &ctx).await.unwrap();

        assert!(!handle.is_tracked());
        let script = &scripts.lock().unwrap()[0];
        assert!(script.sent().iter().any(|l| l == "sudo apt update && sudo apt upgrade -y"));
        assert_eq!(script.terminations(), 1);
        assert!(ctx.processes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn update_tolerates_a_silent_upgrade() {
        let (ctx, _) = context(ScriptedTransport::new);
        let handle = SystemUpdate.run(&target(), None, &ctx).await.unwrap();
        assert_eq!(handle.stage, StageId::SYSTEM_UPDATE);
    }

    #[tokio::test(start_paused = true)]
    async fn mount_uses_tag_and_dir() {
        let (ctx, scripts) =
            context(|| ScriptedTransport::new().on("ls /var/scaphandre", ["intel-rapl:0"]));

        SharedMount::new("/var/scaphandre", "scaphandre")
            .run(&target(), None, &ctx)
            .await
            .unwrap();

        let sent = scripts.lock().unwrap()[0].sent();
        assert!(sent.contains(&"sudo mount -t virtiofs scaphandre /var/scaphandre".to_string()));
    }

    #[tokio::test]
    async fn dead_shell_fails_the_stage() {
        let (ctx, _) = context(|| ScriptedTransport::new().swallow_echo().close_when_idle());
        let err = SharedMount::new("/var/scaphandre", "scaphandre")
            .run(&target(), None, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Session(e) if e.is_closed()));
    }
}
