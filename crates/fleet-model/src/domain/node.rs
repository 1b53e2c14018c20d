use std::fmt;

use serde::{Deserialize, Serialize};

use crate::NodeIndex;

/// Identifier of a benchmark node (the VM name, also the remote login user).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A node together with the endpoint its remote shell is reached through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTarget {
    /// Position of the node in the run inventory.
    pub index: NodeIndex,
    /// VM name.
    pub id: NodeId,
    /// Host (address) the VM is reachable at.
    pub endpoint: String,
}

impl NodeTarget {
    pub fn new(index: NodeIndex, id: impl Into<NodeId>, endpoint: impl Into<String>) -> Self {
        Self {
            index,
            id: id.into(),
            endpoint: endpoint.into(),
        }
    }

    /// `user@host` login string used by the remote shell.
    pub fn login(&self) -> String {
        format!("{}@{}", self.id, self.endpoint)
    }
}
