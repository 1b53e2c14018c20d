use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout},
};
use tracing::{debug, trace};

use crate::{
    error::SessionError,
    transport::Transport,
    util::{cmd_program, kill_group},
};

/// Local process whose stdin/stdout form the shell stream.
#[derive(Clone, Debug, Default)]
pub struct ProcConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl ProcConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// [`Transport`] over a child process started in its own process group.
///
/// The group leader is the proxy (e.g. `ssh`); terminating the transport
/// signals the whole group so remote-side helpers started through it go too.
pub struct ProcessTransport {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    pid: i32,
    terminated: bool,
}

impl ProcessTransport {
    pub fn spawn(cfg: &ProcConfig) -> Result<Self, SessionError> {
        if cfg.program.is_empty() {
            return Err(SessionError::Io("program is empty".into()));
        }

        let mut cmd = cmd_program(&cfg.program, &cfg.args);
        if let Some(cwd) = &cfg.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &cfg.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        trace!(target: "fleet.session.proc", program = %cfg.program, args = ?cfg.args, "spawn");
        let mut child = cmd.spawn()?;

        let pid = child
            .id()
            .map(|id| id as i32)
            .ok_or_else(|| SessionError::Io("child exited before pid was read".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Io("stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Io("stdout not piped".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let program = cfg.program.clone();
            tokio::spawn(async move {
                let mut err_lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = err_lines.next_line().await {
                    debug!(target: "fleet.session.stderr", %program, pid, %line);
                }
            });
        }

        Ok(Self {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            pid,
            terminated: false,
        })
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn send(&mut self, line: &str) -> Result<(), SessionError> {
        if self.terminated {
            return Err(SessionError::StreamClosed);
        }
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, SessionError> {
        Ok(self.lines.next_line().await?)
    }

    fn pid(&self) -> Option<i32> {
        Some(self.pid)
    }

    fn terminate(&mut self) -> Result<(), SessionError> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                let delivered = kill_group(self.pid).map_err(|e| SessionError::Signal(e.to_string()))?;
                debug!(target: "fleet.session.proc", pid = self.pid, delivered, "process group terminated");
            } else {
                let _ = self.child.start_kill();
                debug!(target: "fleet.session.proc", pid = self.pid, "child killed");
            }
        }
        Ok(())
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        // Reap without blocking if the child already exited.
        let _ = self.child.try_wait();
    }
}
