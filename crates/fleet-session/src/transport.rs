use async_trait::async_trait;

use crate::error::SessionError;

/// Bidirectional, line-buffered stream attached to a remote shell.
///
/// Lines are written in submission order and read back as discrete lines
/// without their terminator.
#[async_trait]
pub trait Transport: Send {
    /// Write one line (a newline is appended).
    async fn send(&mut self, line: &str) -> Result<(), SessionError>;

    /// Next output line; `Ok(None)` once the stream has ended.
    ///
    /// Must be cancel-safe: callers race it against timers.
    async fn recv(&mut self) -> Result<Option<String>, SessionError>;

    /// Local process (group) id backing the stream, if any.
    fn pid(&self) -> Option<i32>;

    /// Signal the process group behind the stream. Idempotent.
    fn terminate(&mut self) -> Result<(), SessionError>;
}
