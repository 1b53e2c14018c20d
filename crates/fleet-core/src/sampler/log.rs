use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use fleet_model::{NodeId, Sample};

use crate::error::SamplerError;

/// Destination of emitted samples.
pub trait SampleSink: Send {
    fn append(&mut self, sample: &Sample) -> Result<(), SamplerError>;

    /// Flush and release the sink. Called once when sampling ends.
    fn finish(&mut self) -> Result<(), SamplerError> {
        Ok(())
    }
}

impl SampleSink for Vec<Sample> {
    fn append(&mut self, sample: &Sample) -> Result<(), SamplerError> {
        self.push(sample.clone());
        Ok(())
    }
}

/// Append-only JSON Lines sample log, flushed after every record.
pub struct SampleLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    records: u64,
}

impl SampleLog {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, SamplerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// All samples in `path`, in file order.
    pub fn replay(path: &Path) -> Result<Vec<Sample>, SamplerError> {
        let reader = BufReader::new(File::open(path)?);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }

    /// Samples of `path` grouped per node, each group ordered by sequence index.
    pub fn replay_by_node(path: &Path) -> Result<BTreeMap<NodeId, Vec<Sample>>, SamplerError> {
        let mut grouped: BTreeMap<NodeId, Vec<Sample>> = BTreeMap::new();
        for sample in Self::replay(path)? {
            grouped.entry(sample.node.clone()).or_default().push(sample);
        }
        for samples in grouped.values_mut() {
            samples.sort_by_key(|s| s.seq);
        }
        Ok(grouped)
    }
}

impl SampleSink for SampleLog {
    fn append(&mut self, sample: &Sample) -> Result<(), SamplerError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SamplerError::Log(format!("{} already closed", self.path.display())))?;
        serde_json::to_writer(&mut *writer, sample)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        self.records += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SamplerError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for SampleLog {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
