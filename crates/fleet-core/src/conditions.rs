//! Bounded waiting for a set of named readiness conditions.
//!
//! A [`ConditionTracker`] repeatedly submits a status query through a
//! [`Session`], reads the query's output up to a barrier, and resolves
//! conditions by substring match until every one is satisfied or the
//! overall budget runs out.
use std::time::Duration;

use fleet_model::{ConditionSet, NodeId};
use fleet_session::Session;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// How a status line relates to the conditions being waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    Satisfied,
    Failed,
}

/// A remote status command and the classification of its output lines.
pub trait ReadinessQuery: Send + Sync {
    /// Shell command printing one line per checked object.
    fn command(&self) -> String;

    /// Upper bound for a single query to finish printing.
    fn window(&self) -> Duration;

    fn classify(&self, line: &str) -> Option<LineEvent>;
}

/// `kubectl wait` for pod readiness in one namespace or cluster wide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubePodQuery {
    namespace: Option<String>,
    wait: Duration,
}

impl KubePodQuery {
    const SLACK: Duration = Duration::from_secs(10);

    pub fn namespace(ns: impl Into<String>) -> Self {
        Self {
            namespace: Some(ns.into()),
            wait: Duration::from_secs(120),
        }
    }

    pub fn all_namespaces() -> Self {
        Self {
            namespace: None,
            wait: Duration::from_secs(120),
        }
    }

    /// Server-side wait of one `kubectl wait` call.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

impl ReadinessQuery for KubePodQuery {
    fn command(&self) -> String {
        let scope = match &self.namespace {
            Some(ns) => format!("-n {ns}"),
            None => "--all-namespaces".to_string(),
        };
        format!(
            "kubectl wait pod --all {scope} --for=condition=Ready --timeout {}s",
            self.wait.as_secs()
        )
    }

    fn window(&self) -> Duration {
        self.wait + Self::SLACK
    }

    fn classify(&self, line: &str) -> Option<LineEvent> {
        if !line.contains("pod/") && !line.contains("pods/") {
            return None;
        }
        if line.contains("condition met") {
            Some(LineEvent::Satisfied)
        } else if line.contains("timed out waiting for the condition on") {
            Some(LineEvent::Failed)
        } else {
            None
        }
    }
}

/// Outcome of one [`ConditionTracker::await_all`] call.
#[derive(Debug, Clone)]
pub struct ConditionReport {
    /// Final state; nothing is left pending.
    pub set: ConditionSet,
    pub queries: u32,
    pub elapsed: Duration,
    /// The shell stream ended before the set settled.
    pub closed: bool,
}

impl ConditionReport {
    pub fn all_satisfied(&self) -> bool {
        self.set.all_satisfied()
    }

    pub fn timed_out(&self) -> Vec<&str> {
        self.set.timed_out().collect()
    }
}

/// Retry policy for readiness waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionTracker {
    retry: Duration,
}

impl Default for ConditionTracker {
    fn default() -> Self {
        Self {
            retry: Duration::from_millis(500),
        }
    }
}

impl ConditionTracker {
    pub fn new(retry: Duration) -> Self {
        Self { retry }
    }

    pub fn retry(&self) -> Duration {
        self.retry
    }

    /// Wait until every condition in `names` is satisfied, or `budget` elapses.
    ///
    /// Never fails: conditions still pending at the deadline are reported as
    /// timed out, and a closed stream expires the whole remaining set.
    pub async fn await_all<I, S>(
        &self,
        session: &mut Session,
        names: I,
        budget: Duration,
        query: &dyn ReadinessQuery,
    ) -> ConditionReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let started = Instant::now();
        let deadline = started + budget;
        let node = session.node().clone();
        let mut set = ConditionSet::new(names);
        let mut queries = 0u32;
        let mut closed = false;

        // Output of earlier commands must not be mistaken for query results.
        if let Err(e) = session.drain_to_barrier(Some(deadline), |_| {}).await
            && !e.is_timeout()
        {
            closed = true;
        }

        while !closed && set.pending_count() > 0 && Instant::now() < deadline {
            queries += 1;
            if let Err(e) = session.submit(&query.command()).await {
                warn!(target: "fleet.conditions", %node, error = %e, "readiness query not sent");
                closed = true;
                break;
            }

            let attempt_deadline = deadline.min(Instant::now() + query.window());
            let res = session
                .drain_to_barrier(Some(attempt_deadline), |line| {
                    apply_line(&node, &mut set, query, line)
                })
                .await;
            match res {
                Ok(()) => {}
                Err(e) if e.is_timeout() => {
                    debug!(target: "fleet.conditions", %node, query = queries, "query did not finish in its window");
                }
                Err(e) => {
                    warn!(target: "fleet.conditions", %node, error = %e, "shell closed while waiting");
                    closed = true;
                    break;
                }
            }

            if set.pending_count() == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.retry.min(deadline - now)).await;
        }

        set.expire();
        let report = ConditionReport {
            set,
            queries,
            elapsed: started.elapsed(),
            closed,
        };
        if report.all_satisfied() {
            info!(
                target: "fleet.conditions",
                %node,
                conditions = report.set.len(),
                queries,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "all conditions satisfied"
            );
        } else {
            warn!(
                target: "fleet.conditions",
                %node,
                timed_out = ?report.timed_out(),
                closed,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "conditions not satisfied within budget"
            );
        }
        report
    }
}

fn apply_line(node: &NodeId, set: &mut ConditionSet, query: &dyn ReadinessQuery, line: &str) {
    match query.classify(line) {
        Some(LineEvent::Satisfied) => {
            if let Some(name) = set.satisfy_first_match(line) {
                debug!(target: "fleet.conditions", %node, condition = name, "condition satisfied");
            }
        }
        Some(LineEvent::Failed) => {
            if let Some(name) = set.record_failure(line) {
                debug!(target: "fleet.conditions", %node, condition = name, "condition not ready yet");
            }
        }
        None => {}
    }
}
