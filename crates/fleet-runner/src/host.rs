//! Host-side processes around a run.
use std::path::Path;

use std::time::Duration;

use fleet_model::{NodeTarget, ProcessHandle, StageId};
use fleet_session::{LineVerdict, ProcConfig, Session};
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

use crate::{config::LocalCommand, error::RunnerError};

/// Start `cmd` on the host and wait for its readiness line.
///
/// The returned session owns the process; terminating it signals the
/// whole process group.
pub async fn start_local(cmd: &LocalCommand, what: &'static str) -> Result<Session, RunnerError> {
    let proc = ProcConfig::new(cmd.program.as_str()).args(&cmd.args);
    let mut session = Session::spawn_local("host", &proc)?;
    info!(target: "fleet.runner.host", program = %cmd.program, pid = ?session.pid(), "{what} started");

    let res = session
        .wait_for(cmd.ready_timeout(), |line| {
            line.contains(cmd.ready_line.as_str()).then_some(LineVerdict::Matched)
        })
        .await;
    match res {
        Ok(_) => {
            info!(target: "fleet.runner.host", "{what} ready");
            Ok(session)
        }
        Err(e) => {
            warn!(target: "fleet.runner.host", error = %e, "{what} not ready");
            let _ = session.terminate();
            Err(if e.is_timeout() {
                RunnerError::NotReady { what }
            } else {
                e.into()
            })
        }
    }
}

/// Keep reading `session` in a background task until its stream closes.
///
/// The returned handle carries the process-group leader's pid, so
/// `ProcessTable::teardown` signals the group, which ends the task.
pub fn drain_in_background(mut session: Session, stage: StageId) -> ProcessHandle {
    let node = session.node().clone();
    let handle = match session.pid() {
        Some(pid) => ProcessHandle::new(node, stage, pid),
        None => ProcessHandle::none(node, stage),
    };
    tokio::spawn(async move {
        let mut lines = 0u64;
        loop {
            match session.read_line(Duration::from_secs(3600)).await {
                Ok(line) => {
                    lines += 1;
                    trace!(target: "fleet.runner.host", node = %session.node(), %line);
                }
                Err(e) if e.is_timeout() => continue,
                Err(_) => break,
            }
        }
        debug!(target: "fleet.runner.host", node = %session.node(), lines, "output drained");
        let _ = session.terminate();
    });
    handle
}

/// Make sure the exporter can write counters for every node.
pub fn prepare_counter_dirs(root: &Path, nodes: &[NodeTarget]) {
    for node in nodes {
        let dir = root.join(node.id.as_str()).join("intel-rapl:0");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(target: "fleet.runner.host", dir = %dir.display(), error = %e, "counter directory not created");
        }
    }
}

/// `virsh destroy` every node; failures are logged.
pub async fn destroy_vms(nodes: &[NodeTarget]) {
    for node in nodes {
        match Command::new("virsh").args(["destroy", node.id.as_str()]).status().await {
            Ok(status) if status.success() => {
                info!(target: "fleet.runner.host", vm = %node.id, "vm destroyed")
            }
            Ok(status) => warn!(target: "fleet.runner.host", vm = %node.id, %status, "virsh destroy failed"),
            Err(e) => warn!(target: "fleet.runner.host", vm = %node.id, error = %e, "virsh not runnable"),
        }
    }
}
