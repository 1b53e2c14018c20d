use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use fleet_model::{ProcessHandle, StageId};
use fleet_session::{Session, SessionError, kill_group};
use tracing::{debug, info, warn};

/// Background processes started by stages, keyed by proxy pid.
///
/// Sessions whose remote command must outlive the stage (exporters,
/// port-forwards, load generators) are adopted here so their shell stays
/// open until teardown.
#[derive(Clone, Default)]
pub struct ProcessTable {
    inner: Arc<Mutex<ProcessTableInner>>,
}

#[derive(Default)]
struct ProcessTableInner {
    sessions: HashMap<i32, Session>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProcessTableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of `session` and return the handle describing it.
    ///
    /// A session without a local pid cannot be torn down by handle; it is
    /// terminated right away and an untracked handle is returned.
    pub fn adopt(&self, stage: StageId, mut session: Session) -> ProcessHandle {
        let node = session.node().clone();
        let Some(pid) = session.pid().filter(|p| *p > 0) else {
            warn!(target: "fleet.processes", %node, %stage, "session has no pid; not tracked");
            let _ = session.terminate();
            return ProcessHandle::none(node, stage);
        };
        debug!(target: "fleet.processes", %node, %stage, pid, "background process adopted");
        if let Some(mut previous) = self.lock().sessions.insert(pid, session) {
            let _ = previous.terminate();
        }
        ProcessHandle::new(node, stage, pid)
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.lock().sessions.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate the process behind `handle`.
    ///
    /// Adopted sessions are closed through their transport; any other
    /// tracked pid gets its process group signalled. Untracked handles and
    /// already-gone processes are no-ops.
    pub fn terminate(&self, handle: &ProcessHandle) -> Result<(), SessionError> {
        if !handle.is_tracked() {
            return Ok(());
        }
        let adopted = self.lock().sessions.remove(&handle.pid);
        match adopted {
            Some(mut session) => session.terminate(),
            None => kill_group(handle.pid)
                .map(|_| ())
                .map_err(|e| SessionError::Signal(e.to_string())),
        }
    }

    /// Terminate every handle, then whatever else is still adopted.
    ///
    /// Failures are logged and do not stop the sweep. Returns the number of
    /// processes that could not be signalled.
    pub fn teardown(&self, handles: &[ProcessHandle]) -> usize {
        let mut failed = 0;
        for handle in handles.iter().filter(|h| h.is_tracked()) {
            if let Err(e) = self.terminate(handle) {
                failed += 1;
                warn!(
                    target: "fleet.processes",
                    node = %handle.node,
                    stage = %handle.stage,
                    pid = handle.pid,
                    error = %e,
                    "failed to terminate background process"
                );
            }
        }

        let leftovers: Vec<(i32, Session)> = self.lock().sessions.drain().collect();
        for (pid, mut session) in leftovers {
            if let Err(e) = session.terminate() {
                failed += 1;
                warn!(target: "fleet.processes", pid, error = %e, "failed to terminate leftover session");
            }
        }

        info!(target: "fleet.processes", handles = handles.len(), failed, "teardown finished");
        failed
    }
}
