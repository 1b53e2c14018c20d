//! Scripted shell doubles for exercising sessions without a remote host.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use fleet_model::NodeTarget;
use tokio::sync::Notify;

use crate::{connector::Connector, error::SessionError, session::Session, transport::Transport};

struct Rule {
    needle: String,
    replies: VecDeque<Vec<String>>,
}

#[derive(Default)]
struct ScriptState {
    inbox: VecDeque<String>,
    rules: Vec<Rule>,
    sent: Vec<String>,
    terminations: u32,
    echo_input: bool,
    swallow_echo: bool,
    close_when_idle: bool,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<ScriptState>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory shell that answers submitted lines from a script.
///
/// - `echo "<word>"` prints `<word>` (unless [`ScriptedTransport::swallow_echo`]).
/// - Lines containing a registered needle print the registered reply.
/// - With nothing to print, `recv` waits like an idle shell, or reports
///   end of stream after [`ScriptedTransport::close_when_idle`].
pub struct ScriptedTransport {
    shared: Arc<Shared>,
    pid: i32,
}

/// Inspection/driving handle that stays usable after the transport moved into a session.
#[derive(Clone)]
pub struct ScriptHandle {
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            pid: 4242,
        }
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = pid;
        self
    }

    /// Echo every submitted line back, like a `-tt` terminal does.
    pub fn echo_input(self) -> Self {
        self.shared.lock().echo_input = true;
        self
    }

    /// Never print the argument of `echo` commands (a remote that stopped responding).
    pub fn swallow_echo(self) -> Self {
        self.shared.lock().swallow_echo = true;
        self
    }

    /// Report end of stream once all scripted output was consumed.
    pub fn close_when_idle(self) -> Self {
        self.shared.lock().close_when_idle = true;
        self
    }

    /// Output available before anything is submitted.
    pub fn push_output<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared
            .lock()
            .inbox
            .extend(lines.into_iter().map(Into::into));
        self
    }

    /// Reply with `lines` every time a submitted line contains `needle`.
    pub fn on<I, S>(self, needle: &str, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let reply = lines.into_iter().map(Into::into).collect();
        self.on_sequence(needle, vec![reply])
    }

    /// Successive replies for successive matches; the last one repeats.
    pub fn on_sequence(self, needle: &str, replies: Vec<Vec<String>>) -> Self {
        self.shared.lock().rules.push(Rule {
            needle: needle.to_string(),
            replies: replies.into(),
        });
        self
    }

    pub fn handle(&self) -> ScriptHandle {
        ScriptHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptHandle {
    /// Lines submitted so far.
    pub fn sent(&self) -> Vec<String> {
        self.shared.lock().sent.clone()
    }

    pub fn terminations(&self) -> u32 {
        self.shared.lock().terminations
    }

    pub fn push(&self, line: impl Into<String>) {
        self.shared.lock().inbox.push_back(line.into());
        self.shared.wake.notify_one();
    }

    /// End the stream after the pending output.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.wake.notify_one();
    }
}

fn echoed_word(line: &str) -> Option<&str> {
    let word = line.strip_prefix("echo \"")?.strip_suffix('"')?;
    (!word.contains('"')).then_some(word)
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, line: &str) -> Result<(), SessionError> {
        {
            let mut st = self.shared.lock();
            st.sent.push(line.to_string());
            if st.echo_input {
                st.inbox.push_back(line.to_string());
            }
            if !st.swallow_echo
                && let Some(word) = echoed_word(line)
            {
                st.inbox.push_back(word.to_string());
            }

            let mut replies = Vec::new();
            for rule in st.rules.iter_mut().filter(|r| line.contains(&r.needle)) {
                let reply = if rule.replies.len() > 1 {
                    rule.replies.pop_front()
                } else {
                    rule.replies.front().cloned()
                };
                replies.extend(reply.unwrap_or_default());
            }
            st.inbox.extend(replies);
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, SessionError> {
        loop {
            {
                let mut st = self.shared.lock();
                if let Some(line) = st.inbox.pop_front() {
                    return Ok(Some(line));
                }
                if st.closed || st.close_when_idle || st.terminations > 0 {
                    return Ok(None);
                }
            }
            self.shared.wake.notified().await;
        }
    }

    fn pid(&self) -> Option<i32> {
        Some(self.pid)
    }

    fn terminate(&mut self) -> Result<(), SessionError> {
        self.shared.lock().terminations += 1;
        self.shared.wake.notify_one();
        Ok(())
    }
}

type Factory = dyn Fn(&NodeTarget) -> Result<ScriptedTransport, SessionError> + Send + Sync;

/// [`Connector`] handing out scripted transports built per node.
pub struct ScriptedConnector {
    factory: Box<Factory>,
}

impl ScriptedConnector {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&NodeTarget) -> Result<ScriptedTransport, SessionError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, target: &NodeTarget) -> Result<Session, SessionError> {
        let transport = (self.factory)(target)?;
        Ok(Session::new(target.id.clone(), Box::new(transport)))
    }
}
