use std::{io, time::Duration};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection to {node} failed: {reason}")]
    Connection { node: String, reason: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote stream closed")]
    StreamClosed,
    #[error("signal delivery failed: {0}")]
    Signal(String),
    #[error("io error: {0}")]
    Io(String),
}

impl SessionError {
    pub fn connection(node: impl Into<String>, reason: impl Into<String>) -> Self {
        SessionError::Connection {
            node: node.into(),
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout(_))
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionError::StreamClosed)
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => SessionError::StreamClosed,
            _ => SessionError::Io(e.to_string()),
        }
    }
}
