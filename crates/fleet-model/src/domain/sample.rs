use std::{fmt, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::{NodeId, SeqIndex};

/// Change marker of an external file (its status-change time).
///
/// Only compared for equality and order, never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub secs: i64,
    pub nanos: u32,
}

impl Fingerprint {
    pub const fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// One synchronized measurement snapshot of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub node: NodeId,
    /// Strictly increasing per node, starting at 0.
    pub seq: SeqIndex,
    pub fingerprint: Fingerprint,
    /// First line of the counter file at sampling time.
    pub reading: String,
    /// CPU time the node's VM process spent in user mode (clock ticks).
    pub user_ticks: u64,
    /// CPU time the node's VM process spent in kernel mode (clock ticks).
    pub system_ticks: u64,
    /// Host-wide user+nice ticks, when a host stat source is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ticks: Option<u64>,
    #[serde(with = "time_serde")]
    pub timestamp: SystemTime,
}

mod time_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        since_epoch.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        let since_epoch = Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)?;
        Ok(UNIX_EPOCH + since_epoch)
    }
}
