use std::path::PathBuf;

use fleet_model::StageId;
use fleet_session::SessionError;
use thiserror::Error;

/// Unrecoverable failure of a single stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("no stage registered as {0}")]
    Unregistered(StageId),
    #[error("invalid argument for {stage}: {reason}")]
    InvalidArgument { stage: StageId, reason: String },
    #[error("{0}")]
    Failed(String),
}

impl StageError {
    /// Returns `true` when the remote session could not be established.
    pub fn is_connection(&self) -> bool {
        matches!(self, StageError::Session(SessionError::Connection { .. }))
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown run configuration: {0}")]
    UnknownConfiguration(String),
    #[error("node worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan table {path}: {reason}")]
    Io { path: PathBuf, reason: String },
    #[error("invalid plan table: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("no nodes to sample")]
    NoNodes,
    #[error("counter file {path} did not appear within {waited_ms} ms")]
    NotReady { path: PathBuf, waited_ms: u64 },
    #[error("probe {path}: {reason}")]
    Probe { path: PathBuf, reason: String },
    #[error("sample log: {0}")]
    Log(String),
}

impl From<serde_json::Error> for SamplerError {
    fn from(e: serde_json::Error) -> Self {
        SamplerError::Log(e.to_string())
    }
}

impl From<std::io::Error> for SamplerError {
    fn from(e: std::io::Error) -> Self {
        SamplerError::Log(e.to_string())
    }
}
