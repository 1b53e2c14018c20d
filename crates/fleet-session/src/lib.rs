//! Interactive remote shells as request/response channels.
//!
//! A [`Session`] wraps one line-oriented shell stream (normally `ssh -tt`)
//! and adds a barrier primitive: [`Session::sync_barrier`] echoes a unique
//! token and returns once the token comes back, which proves that every
//! line submitted before it has produced its output.
mod error;
pub use error::SessionError;

mod transport;
pub use transport::Transport;

pub mod proc;
pub use proc::{ProcConfig, ProcessTransport};

mod ssh;
pub use ssh::{SshConfig, SshConnector};

mod session;
pub use session::{LineVerdict, Session};

mod connector;
pub use connector::Connector;

mod util;
pub use util::{kill_group, shell_escape};

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub mod prelude {
    pub use crate::error::SessionError;
    pub use crate::{Connector, LineVerdict, Session, Transport};
}
