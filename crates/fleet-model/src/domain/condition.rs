use serde::{Deserialize, Serialize};

/// Readiness state of a single named condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionStatus {
    /// Not observed yet.
    Pending,
    /// A "satisfied" line naming the condition was observed.
    Satisfied,
    /// The wait budget ran out while the condition was still pending.
    TimedOut,
}

impl ConditionStatus {
    /// Returns `true` once the condition can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConditionStatus::Satisfied | ConditionStatus::TimedOut)
    }
}

/// A named condition and its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub name: String,
    pub status: ConditionStatus,
    /// Number of "timed out waiting" reports seen for this condition.
    /// Failures keep the condition pending; they are diagnostics only.
    pub failures: u32,
}

/// Ordered set of conditions awaited together.
///
/// Declared order is significant: when several pending names occur in the
/// same output line, the first declared one wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSet {
    entries: Vec<Condition>,
}

impl ConditionSet {
    /// Create a set with every condition pending, preserving declared order.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = names
            .into_iter()
            .map(|name| Condition {
                name: name.into(),
                status: ConditionStatus::Pending,
                failures: 0,
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Condition> {
        self.entries.iter().find(|c| c.name == name)
    }

    pub fn status(&self, name: &str) -> Option<ConditionStatus> {
        self.get(name).map(|c| c.status)
    }

    /// Names still pending, in declared order.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.names_with(ConditionStatus::Pending)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    pub fn satisfied(&self) -> impl Iterator<Item = &str> {
        self.names_with(ConditionStatus::Satisfied)
    }

    pub fn timed_out(&self) -> impl Iterator<Item = &str> {
        self.names_with(ConditionStatus::TimedOut)
    }

    /// Returns `true` when no condition is pending.
    pub fn is_settled(&self) -> bool {
        self.entries.iter().all(|c| c.status.is_terminal())
    }

    pub fn all_satisfied(&self) -> bool {
        self.entries
            .iter()
            .all(|c| c.status == ConditionStatus::Satisfied)
    }

    /// Mark the first pending condition whose name occurs in `line` as satisfied.
    ///
    /// Returns the resolved name. At most one condition is resolved per line.
    pub fn satisfy_first_match(&mut self, line: &str) -> Option<&str> {
        let entry = self.first_pending_match(line)?;
        entry.status = ConditionStatus::Satisfied;
        Some(entry.name.as_str())
    }

    /// Count a failure report against the first pending condition named in `line`.
    pub fn record_failure(&mut self, line: &str) -> Option<&str> {
        let entry = self.first_pending_match(line)?;
        entry.failures += 1;
        Some(entry.name.as_str())
    }

    /// Move every pending condition to [`ConditionStatus::TimedOut`].
    pub fn expire(&mut self) {
        for c in self
            .entries
            .iter_mut()
            .filter(|c| c.status == ConditionStatus::Pending)
        {
            c.status = ConditionStatus::TimedOut;
        }
    }

    fn first_pending_match(&mut self, line: &str) -> Option<&mut Condition> {
        self.entries
            .iter_mut()
            .find(|c| c.status == ConditionStatus::Pending && line.contains(c.name.as_str()))
    }

    fn names_with(&self, status: ConditionStatus) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |c| c.status == status)
            .map(|c| c.name.as_str())
    }
}
