use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown execution mode: {0} (expected: parallel|sequential)")]
    UnknownMode(String),
}
