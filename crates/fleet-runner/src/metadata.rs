use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Serialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::error::RunnerError;

/// Identifier of one measurement run: `<index>_<measure interval>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunId {
    pub experiment: String,
    pub index: u32,
    pub interval: u64,
}

impl RunId {
    pub fn new(experiment: impl Into<String>, index: u32, interval: u64) -> Self {
        Self {
            experiment: experiment.into(),
            index,
            interval,
        }
    }

    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.index, self.interval)
    }

    pub fn dir(&self, results: &Path) -> PathBuf {
        results.join(&self.experiment)
    }

    pub fn samples_path(&self, results: &Path) -> PathBuf {
        self.dir(results).join(format!("{}_samples.jsonl", self.file_stem()))
    }

    pub fn metadata_path(&self, results: &Path) -> PathBuf {
        self.dir(results).join(format!("{}_metadata.json", self.file_stem()))
    }

    /// Whether an earlier invocation already produced output for this run.
    pub fn already_ran(&self, results: &Path) -> bool {
        let stem = self.file_stem();
        let Ok(entries) = std::fs::read_dir(self.dir(results)) else {
            return false;
        };
        entries.filter_map(Result::ok).any(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.strip_prefix(stem.as_str())
                .is_some_and(|rest| rest.starts_with('_') || rest.starts_with('.'))
        })
    }
}

/// Per-run bookkeeping written next to the samples.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub experiment: String,
    pub run: String,
    pub host: String,
    pub started_at: String,
    pub provisioning_secs: f64,
    pub exporter_start_secs: f64,
    pub setup_secs: f64,
    pub sampling_secs: f64,
    pub samples: u64,
    pub vms_active: usize,
    pub vms_experiment: usize,
    pub failed_nodes: Vec<String>,
}

impl RunMetadata {
    pub fn new(id: &RunId, started_at: OffsetDateTime) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            experiment: id.experiment.clone(),
            run: id.file_stem(),
            host,
            started_at: started_at.format(&Rfc3339).unwrap_or_default(),
            ..Self::default()
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), RunnerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

pub fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_output_marks_run_as_done() {
        let dir = tempfile::tempdir().unwrap();
        let id = RunId::new("kube_sca", 1, 300);
        assert!(!id.already_ran(dir.path()));

        std::fs::create_dir_all(id.dir(dir.path())).unwrap();
        std::fs::write(id.dir(dir.path()).join("11_300_samples.jsonl"), "").unwrap();
        assert!(!id.already_ran(dir.path()), "run 11 is not run 1");

        std::fs::write(id.samples_path(dir.path()), "").unwrap();
        assert!(id.already_ran(dir.path()));
    }

    #[test]
    fn metadata_is_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let id = RunId::new("qemu", 0, 60);
        let mut meta = RunMetadata::new(&id, OffsetDateTime::UNIX_EPOCH);
        meta.samples = 12;
        meta.vms_experiment = 2;
        let path = id.metadata_path(dir.path());
        meta.write(&path).unwrap();

        let v: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(v["run"], "0_60");
        assert_eq!(v["samples"], 12);
        assert_eq!(v["startedAt"], "1970-01-01T00:00:00Z");
    }
}
