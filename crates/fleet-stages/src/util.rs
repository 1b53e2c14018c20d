use std::time::Duration;

use fleet_core::{ConditionReport, KubePodQuery, RunContext, StageError};
use fleet_model::{ProcessHandle, StageArg, StageId};
use fleet_session::{Session, SessionError};
use tracing::warn;

/// Close a session whose remote work is complete.
pub(crate) fn close(mut session: Session, stage: StageId) -> ProcessHandle {
    if let Err(e) = session.terminate() {
        warn!(target: "fleet.stages", node = %session.node(), %stage, error = %e, "session close failed");
    }
    ProcessHandle::none(session.node().clone(), stage)
}

/// Close the session when `res` failed, otherwise keep it for teardown.
pub(crate) fn adopt_or_close(
    ctx: &RunContext,
    stage: StageId,
    session: Session,
    res: Result<(), StageError>,
) -> Result<ProcessHandle, StageError> {
    match res {
        Ok(()) => Ok(ctx.adopt(stage, session)),
        Err(e) => {
            close(session, stage);
            Err(e)
        }
    }
}

/// Close the session, then hand back `res`.
pub(crate) fn finish(
    session: Session,
    stage: StageId,
    res: Result<(), StageError>,
) -> Result<ProcessHandle, StageError> {
    let handle = close(session, stage);
    res.map(|()| handle)
}

/// Turn a timed-out wait into a warning; other session errors stay fatal.
pub(crate) fn tolerate_timeout<T>(
    res: Result<T, SessionError>,
    session: &Session,
    what: &str,
) -> Result<Option<T>, StageError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_timeout() => {
            warn!(target: "fleet.stages", node = %session.node(), error = %e, "{what} not seen; continuing");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Wait for pod readiness within the context's readiness budget.
///
/// Timed-out pods are tolerated; a dead shell is not.
pub(crate) async fn await_pods(
    ctx: &RunContext,
    session: &mut Session,
    pods: &[String],
    query: KubePodQuery,
) -> Result<ConditionReport, StageError> {
    let report = ctx
        .tracker()
        .await_all(session, pods.iter().cloned(), ctx.timeouts().readiness, &query)
        .await;
    if report.closed {
        return Err(SessionError::StreamClosed.into());
    }
    Ok(report)
}

/// `Flag` argument, `true` when absent.
pub(crate) fn wait_flag(arg: Option<&StageArg>) -> bool {
    arg.and_then(StageArg::as_flag).unwrap_or(true)
}

/// Pause letting a node settle before the next stage talks to it.
pub(crate) const SETTLE: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_flag_defaults_to_waiting() {
        assert!(wait_flag(None));
        assert!(!wait_flag(Some(&StageArg::Flag(false))));
        assert!(wait_flag(Some(&StageArg::Count(0))));
    }
}
