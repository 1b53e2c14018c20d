use std::{fmt, time::Duration};

use fleet_model::NodeId;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::SessionError,
    proc::{ProcConfig, ProcessTransport},
    transport::Transport,
    util::shell_escape,
};

const BARRIER_PREFIX: &str = "fleet-sync";

/// Classification of an output line while waiting for an expected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineVerdict {
    /// The awaited message appeared.
    Matched,
    /// A known failure message appeared instead.
    Rejected,
}

enum Recv {
    Line(String),
    Elapsed,
}

/// One interactive remote shell, owned by the stage that opened it.
pub struct Session {
    node: NodeId,
    transport: Box<dyn Transport>,
    issued: u64,
    outstanding: u32,
    barrier_timeout: Option<Duration>,
    terminated: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("node", &self.node)
            .field("pid", &self.transport.pid())
            .field("barriers", &self.issued)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(node: NodeId, transport: Box<dyn Transport>) -> Self {
        Self {
            node,
            transport,
            issued: 0,
            outstanding: 0,
            barrier_timeout: None,
            terminated: false,
        }
    }

    /// Session over a local process (used for host-side helpers).
    pub fn spawn_local(node: impl Into<NodeId>, cfg: &ProcConfig) -> Result<Self, SessionError> {
        let node = node.into();
        let transport = ProcessTransport::spawn(cfg)
            .map_err(|e| SessionError::connection(node.as_str(), e.to_string()))?;
        Ok(Self::new(node, Box::new(transport)))
    }

    /// Bound every [`Session::sync_barrier`] call. Without it the barrier waits forever.
    pub fn with_barrier_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn pid(&self) -> Option<i32> {
        self.transport.pid()
    }

    /// Barrier tokens submitted whose echo has not been observed yet.
    pub fn outstanding_barriers(&self) -> u32 {
        self.outstanding
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Queue `line` for execution on the remote shell.
    pub async fn submit(&mut self, line: &str) -> Result<(), SessionError> {
        trace!(target: "fleet.session.in", node = %self.node, %line);
        self.transport.send(line).await
    }

    /// Next output line within `timeout`.
    pub async fn read_line(&mut self, timeout: Duration) -> Result<String, SessionError> {
        match self.recv_until(Some(Instant::now() + timeout)).await? {
            Recv::Line(line) => Ok(line),
            Recv::Elapsed => Err(SessionError::Timeout(timeout)),
        }
    }

    /// Block until every previously submitted command has produced its output.
    pub async fn sync_barrier(&mut self) -> Result<(), SessionError> {
        let deadline = self.barrier_timeout.map(|t| Instant::now() + t);
        self.drain_to_barrier(deadline, |_| {}).await
    }

    pub async fn sync_barrier_within(&mut self, timeout: Duration) -> Result<(), SessionError> {
        self.drain_to_barrier(Some(Instant::now() + timeout), |_| {})
            .await
    }

    /// Submit a fresh barrier token and hand every line preceding it to `visit`.
    ///
    /// Lines carrying the token together with `echo` are the terminal echo of
    /// the submission itself and are skipped. Tokens of earlier, abandoned
    /// barriers never match because each token is unique.
    pub async fn drain_to_barrier<F>(
        &mut self,
        deadline: Option<Instant>,
        mut visit: F,
    ) -> Result<(), SessionError>
    where
        F: FnMut(&str) + Send,
    {
        let started = Instant::now();
        let token = self.next_token();
        self.submit(&format!("echo \"{token}\"")).await?;
        self.outstanding += 1;
        debug!(target: "fleet.session.barrier", node = %self.node, %token, "waiting for barrier");

        loop {
            match self.recv_until(deadline).await? {
                Recv::Line(line) => {
                    if line.contains(token.as_str()) && !line.contains("echo") {
                        self.outstanding -= 1;
                        debug!(
                            target: "fleet.session.barrier",
                            node = %self.node,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "barrier reached"
                        );
                        return Ok(());
                    }
                    trace!(target: "fleet.session.out", node = %self.node, %line);
                    visit(&line);
                }
                Recv::Elapsed => {
                    let waited = deadline
                        .map(|d| d.saturating_duration_since(started))
                        .unwrap_or_default();
                    warn!(
                        target: "fleet.session.barrier",
                        node = %self.node,
                        %token,
                        waited_ms = waited.as_millis() as u64,
                        "barrier not reached"
                    );
                    return Err(SessionError::Timeout(waited));
                }
            }
        }
    }

    /// Output produced by all commands submitted so far.
    pub async fn collect_to_barrier(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<String>, SessionError> {
        let mut lines = Vec::new();
        self.drain_to_barrier(Some(Instant::now() + timeout), |line| {
            lines.push(line.to_string())
        })
        .await?;
        Ok(lines)
    }

    /// Read lines until `classify` recognises one, or `timeout` elapses.
    pub async fn wait_for<F>(
        &mut self,
        timeout: Duration,
        mut classify: F,
    ) -> Result<(LineVerdict, String), SessionError>
    where
        F: FnMut(&str) -> Option<LineVerdict> + Send,
    {
        let deadline = Instant::now() + timeout;
        loop {
            match self.recv_until(Some(deadline)).await? {
                Recv::Line(line) => {
                    debug!(target: "fleet.session.out", node = %self.node, %line);
                    if let Some(verdict) = classify(&line) {
                        return Ok((verdict, line));
                    }
                }
                Recv::Elapsed => return Err(SessionError::Timeout(timeout)),
            }
        }
    }

    /// Wait for a line containing any `success` marker or any `failure` marker.
    ///
    /// Failure markers are checked first.
    pub async fn expect_line(
        &mut self,
        success: &[&str],
        failure: &[&str],
        timeout: Duration,
    ) -> Result<(LineVerdict, String), SessionError> {
        self.wait_for(timeout, |line| {
            if failure.iter().any(|m| line.contains(m)) {
                Some(LineVerdict::Rejected)
            } else if success.iter().any(|m| line.contains(m)) {
                Some(LineVerdict::Matched)
            } else {
                None
            }
        })
        .await
    }

    /// Overwrite `path` on the remote side with `content`, then sync.
    ///
    /// Empty content leaves the remote file untouched.
    pub async fn write_remote_file(&mut self, path: &str, content: &str) -> Result<(), SessionError> {
        if content.is_empty() {
            debug!(target: "fleet.session.file", node = %self.node, %path, "empty content; skipped");
            return Ok(());
        }
        let escaped = shell_escape(content);
        self.submit(&format!("echo \"{escaped}\" > \"{path}\"")).await?;
        self.sync_barrier().await
    }

    /// Signal the process group of the shell proxy. Idempotent.
    pub fn terminate(&mut self) -> Result<(), SessionError> {
        if self.terminated {
            return Ok(());
        }
        self.transport.terminate()?;
        self.terminated = true;
        info!(target: "fleet.session", node = %self.node, pid = ?self.pid(), "session terminated");
        Ok(())
    }

    fn next_token(&mut self) -> String {
        self.issued += 1;
        format!("{BARRIER_PREFIX}-{}-{}", self.issued, Uuid::new_v4().simple())
    }

    async fn recv_until(&mut self, deadline: Option<Instant>) -> Result<Recv, SessionError> {
        let line = match deadline {
            Some(deadline) => match timeout_at(deadline, self.transport.recv()).await {
                Ok(res) => res?,
                Err(_) => return Ok(Recv::Elapsed),
            },
            None => self.transport.recv().await?,
        };
        line.map(Recv::Line).ok_or(SessionError::StreamClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::testing::ScriptedTransport;

    fn session(t: ScriptedTransport) -> Session {
        Session::new(NodeId::from("cloud0"), Box::new(t))
    }

    #[test]
    fn debug_names_node_and_pid() {
        let s = session(ScriptedTransport::new().with_pid(77));
        let shown = format!("{s:?}");
        assert!(shown.contains("cloud0"));
        assert!(shown.contains("Some(77)"));
    }

    #[tokio::test]
    async fn barrier_tokens_never_repeat() {
        let t = ScriptedTransport::new();
        let handle = t.handle();
        let mut s = session(t);

        for _ in 0..500 {
            s.sync_barrier().await.unwrap();
        }

        let sent = handle.sent();
        let unique: HashSet<_> = sent.iter().collect();
        assert_eq!(sent.len(), 500);
        assert_eq!(unique.len(), 500);
        assert_eq!(s.outstanding_barriers(), 0);
    }

    #[tokio::test]
    async fn barrier_skips_terminal_echo_and_stale_tokens() {
        let t = ScriptedTransport::new()
            .echo_input()
            .push_output(["fleet-sync-1-00000000000000000000000000000000"]);
        let handle = t.handle();
        let mut s = session(t);

        let mut seen = Vec::new();
        s.drain_to_barrier(None, |l| seen.push(l.to_string()))
            .await
            .unwrap();

        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("fleet-sync-1-0000"));
        assert!(seen[1].starts_with("echo \"fleet-sync-1-"));
        assert_eq!(handle.sent().len(), 1);
    }

    #[tokio::test]
    async fn collect_returns_output_of_earlier_commands() {
        let t = ScriptedTransport::new().on("ls /var/scaphandre", ["intel-rapl:0"]);
        let mut s = session(t);

        s.submit("ls /var/scaphandre").await.unwrap();
        let lines = s.collect_to_barrier(Duration::from_secs(1)).await.unwrap();
        assert_eq!(lines, vec!["intel-rapl:0".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn read_line_times_out_on_silent_shell() {
        let mut s = session(ScriptedTransport::new());
        let err = s.read_line(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_barrier_times_out_and_stays_outstanding() {
        let mut s = session(ScriptedTransport::new().swallow_echo());
        let err = s.sync_barrier_within(Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout(d) if d == Duration::from_secs(3)));
        assert_eq!(s.outstanding_barriers(), 1);
    }

    #[tokio::test]
    async fn closed_stream_is_not_a_timeout() {
        let mut s = session(ScriptedTransport::new().close_when_idle().swallow_echo());
        assert!(s.read_line(Duration::from_secs(1)).await.unwrap_err().is_closed());
        assert!(s.sync_barrier().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let t = ScriptedTransport::new();
        let handle = t.handle();
        let mut s = session(t);

        s.terminate().unwrap();
        s.terminate().unwrap();
        assert!(s.is_terminated());
        assert_eq!(handle.terminations(), 1);
    }

    #[tokio::test]
    async fn write_remote_file_escapes_and_syncs() {
        let t = ScriptedTransport::new();
        let handle = t.handle();
        let mut s = session(t);

        s.write_remote_file("pod.yaml", "").await.unwrap();
        assert!(handle.sent().is_empty());

        s.write_remote_file("pod.yaml", "name: \"$X\"").await.unwrap();
        let sent = handle.sent();
        assert_eq!(sent[0], r#"echo "name: \"\$X\"" > "pod.yaml""#);
        assert!(sent[1].starts_with("echo \"fleet-sync-"));
    }

    #[tokio::test]
    async fn wait_for_reports_match_or_rejection() {
        let t = ScriptedTransport::new().push_output([
            "Reading package lists...",
            "Failed to restart snapd.service",
        ]);
        let mut s = session(t);

        let (verdict, line) = s
            .wait_for(Duration::from_secs(1), |l| {
                if l.contains("done") {
                    Some(LineVerdict::Matched)
                } else if l.contains("Failed to restart snapd") {
                    Some(LineVerdict::Rejected)
                } else {
                    None
                }
            })
            .await
            .unwrap();
        assert_eq!(verdict, LineVerdict::Rejected);
        assert!(line.contains("snapd"));
    }

    #[tokio::test(start_paused = true)]
    async fn expect_line_prefers_failure_markers() {
        let t = ScriptedTransport::new().push_output(["Blocking failed", "Blocking 4 cpu"]);
        let mut s = session(t);

        let (verdict, _) = s
            .expect_line(&["Blocking"], &["failed"], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(verdict, LineVerdict::Rejected);

        let (verdict, line) = s
            .expect_line(&["Blocking"], &["failed"], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(verdict, LineVerdict::Matched);
        assert_eq!(line, "Blocking 4 cpu");

        assert!(
            s.expect_line(&["Blocking"], &[], Duration::from_secs(1))
                .await
                .unwrap_err()
                .is_timeout()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn barrier_over_a_real_shell() {
        let mut s = Session::spawn_local("local", &ProcConfig::new("sh")).unwrap();
        s.submit("echo first").await.unwrap();
        s.submit("echo second").await.unwrap();

        let lines = s.collect_to_barrier(Duration::from_secs(5)).await.unwrap();
        assert_eq!(lines, vec!["first".to_string(), "second".to_string()]);
        s.terminate().unwrap();
    }
}
