use async_trait::async_trait;
use fleet_model::NodeTarget;

use crate::{error::SessionError, session::Session};

/// Opens interactive sessions to nodes.
///
/// Stages never spawn transports themselves; they go through the connector
/// held by the run context, which lets tests substitute scripted shells.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, target: &NodeTarget) -> Result<Session, SessionError>;
}
