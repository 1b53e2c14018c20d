use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use fleet_model::NodeTarget;
use tracing::{info, warn};

use crate::{
    connector::Connector,
    error::SessionError,
    proc::{ProcConfig, ProcessTransport},
    session::Session,
};

/// How remote shells are started.
#[derive(Clone, Debug)]
pub struct SshConfig {
    /// Client binary.
    pub program: String,
    /// Private key passed with `-i`.
    pub identity: Option<PathBuf>,
    /// Extra client options appended after the login.
    pub options: Vec<String>,
    /// When set, a barrier must round-trip within this time for the
    /// connection to count as established.
    pub connect_timeout: Option<Duration>,
    /// Bound applied to every barrier of the opened sessions.
    pub barrier_timeout: Option<Duration>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            identity: None,
            options: Vec::new(),
            connect_timeout: Some(Duration::from_secs(60)),
            barrier_timeout: None,
        }
    }
}

impl SshConfig {
    /// Process line for an interactive login with a forced pseudo-terminal.
    pub fn proc_config(&self, target: &NodeTarget) -> ProcConfig {
        let mut cfg = ProcConfig::new(&self.program).arg("-tt").arg(target.login());
        if let Some(identity) = &self.identity {
            cfg = cfg.arg("-i").arg(identity.display().to_string());
        }
        cfg.args(self.options.iter().cloned())
    }
}

/// [`Connector`] that logs into each node with `ssh -tt`.
pub struct SshConnector {
    cfg: SshConfig,
}

impl SshConnector {
    pub fn new(cfg: SshConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(&self, target: &NodeTarget) -> Result<Session, SessionError> {
        let proc_cfg = self.cfg.proc_config(target);
        let transport = ProcessTransport::spawn(&proc_cfg)
            .map_err(|e| SessionError::connection(target.id.as_str(), e.to_string()))?;
        let mut session = Session::new(target.id.clone(), Box::new(transport))
            .with_barrier_timeout(self.cfg.barrier_timeout);

        if let Some(timeout) = self.cfg.connect_timeout
            && let Err(e) = session.sync_barrier_within(timeout).await
        {
            warn!(target: "fleet.session.ssh", node = %target.id, endpoint = %target.endpoint, error = %e, "shell did not come up");
            let _ = session.terminate();
            return Err(SessionError::connection(target.id.as_str(), e.to_string()));
        }

        info!(target: "fleet.session.ssh", node = %target.id, endpoint = %target.endpoint, pid = ?session.pid(), "session opened");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_forced_tty_login_with_identity() {
        let cfg = SshConfig {
            identity: Some(PathBuf::from("/home/bench/.ssh/id_rsa_fleet")),
            options: vec!["-o".into(), "StrictHostKeyChecking=no".into()],
            ..Default::default()
        };
        let target = NodeTarget::new(0, "cloud0_bench", "192.168.100.2");
        let proc_cfg = cfg.proc_config(&target);

        assert_eq!(proc_cfg.program, "ssh");
        assert_eq!(
            proc_cfg.args,
            vec![
                "-tt",
                "cloud0_bench@192.168.100.2",
                "-i",
                "/home/bench/.ssh/id_rsa_fleet",
                "-o",
                "StrictHostKeyChecking=no"
            ]
        );
    }

    #[tokio::test]
    async fn missing_client_binary_is_a_connection_error() {
        let connector = SshConnector::new(SshConfig {
            program: "/nonexistent/fleet-ssh".into(),
            ..Default::default()
        });
        let target = NodeTarget::new(0, "cloud0", "127.0.0.1");
        let err = connector.open(&target).await.err().unwrap();
        assert!(matches!(err, SessionError::Connection { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exiting_shell_is_a_connection_error() {
        // `false` exits immediately, so the probe barrier sees end of stream.
        let connector = SshConnector::new(SshConfig {
            program: "false".into(),
            connect_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let target = NodeTarget::new(0, "cloud0", "127.0.0.1");
        let err = connector.open(&target).await.err().unwrap();
        assert!(matches!(err, SessionError::Connection { .. }));
    }
}
