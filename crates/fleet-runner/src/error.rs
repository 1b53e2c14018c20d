use std::path::PathBuf;

use fleet_core::{PlanError, SamplerError, StageError};
use fleet_session::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("config {path}: {reason}")]
    Config { path: PathBuf, reason: String },
    #[error("plan table: {0}")]
    Plan(#[from] PlanError),
    #[error("no provisioning log in {0}")]
    NoLog(PathBuf),
    #[error("inventory is empty ({0})")]
    EmptyInventory(PathBuf),
    #[error("no VM process for {0}")]
    MissingVm(String),
    #[error("{what} did not report readiness")]
    NotReady { what: &'static str },
    #[error("run aborted: {0}")]
    Aborted(String),
    #[error("sampler: {0}")]
    Sampler(#[from] SamplerError),
    #[error("stage: {0}")]
    Stage(#[from] StageError),
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}
