//! Change-or-heartbeat sampling of per-node energy counters.
//!
//! The exporter rewrites one counter file per node. Each sweep compares a
//! file's status-change time with the last one seen; a change, or a silent
//! heartbeat interval, emits a [`Sample`] carrying the counter value and the
//! VM's CPU time at that instant. Sampling reads local files only.
mod log;
mod probe;

pub use log::{SampleLog, SampleSink};
pub use probe::{NodeProbe, fingerprint, first_line, parse_host_stat, parse_pid_stat};

use std::{
    collections::BTreeMap,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use fleet_model::{Fingerprint, NodeId, Sample};
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    task,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SamplerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerConfig {
    /// How long to sample after the initial snapshot.
    pub duration: Duration,
    /// Maximum silence per node before a sample is forced.
    pub heartbeat: Duration,
    /// Pause between sweeps over all nodes.
    pub sweep: Duration,
    /// Host-wide CPU statistics (`/proc/stat`); `None` skips host ticks.
    pub host_stat: Option<PathBuf>,
    /// Bound for counter files to appear before sampling starts.
    pub ready_timeout: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(300),
            heartbeat: Duration::from_secs(1),
            sweep: Duration::from_millis(100),
            host_stat: Some(PathBuf::from("/proc/stat")),
            ready_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub per_node: BTreeMap<NodeId, u64>,
    pub total: u64,
    /// Sweeps in which a node could not be probed.
    pub skipped: u64,
    /// Longest interval between two samples of the same node.
    pub max_gap: Duration,
    pub elapsed: Duration,
}

struct NodeState {
    fingerprint: Fingerprint,
    last: Instant,
    next_seq: u64,
    failing: bool,
}

pub struct Sampler {
    cfg: SamplerConfig,
    probes: Vec<NodeProbe>,
}

impl Sampler {
    pub fn new(cfg: SamplerConfig, probes: Vec<NodeProbe>) -> Result<Self, SamplerError> {
        if probes.is_empty() {
            return Err(SamplerError::NoNodes);
        }
        Ok(Self { cfg, probes })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.cfg
    }

    pub fn probes(&self) -> &[NodeProbe] {
        &self.probes
    }

    /// Wait until every counter file exists, bounded by `ready_timeout`.
    pub async fn wait_ready(&self) -> Result<(), SamplerError> {
        let started = Instant::now();
        let deadline = started + self.cfg.ready_timeout;
        for probe in &self.probes {
            while !tokio::fs::try_exists(&probe.counter).await.unwrap_or(false) {
                if Instant::now() >= deadline {
                    return Err(SamplerError::NotReady {
                        path: probe.counter.clone(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                sleep(self.cfg.sweep).await;
            }
        }
        debug!(
            target: "fleet.sampler",
            nodes = self.probes.len(),
            waited_ms = started.elapsed().as_millis() as u64,
            "counter files present"
        );
        Ok(())
    }

    pub async fn run<S: SampleSink>(&self, sink: &mut S) -> Result<SamplerStats, SamplerError> {
        self.run_until(sink, &CancellationToken::new()).await
    }

    /// Sample for the configured duration or until `cancel` fires.
    ///
    /// Every node gets an initial snapshot (sequence 0); a node that cannot be
    /// read yet gets it at its first readable sweep. The sink is
    /// finished on every exit path that reaches it.
    pub async fn run_until<S: SampleSink>(
        &self,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<SamplerStats, SamplerError> {
        let res = self.sample_loop(sink, cancel).await;
        let finished = sink.finish();
        let stats = res?;
        finished?;
        info!(
            target: "fleet.sampler",
            samples = stats.total,
            skipped = stats.skipped,
            max_gap_ms = stats.max_gap.as_millis() as u64,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "sampling finished"
        );
        Ok(stats)
    }

    async fn sample_loop<S: SampleSink>(
        &self,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<SamplerStats, SamplerError> {
        let started = Instant::now();
        let mut stats = SamplerStats::default();
        let mut states = Vec::with_capacity(self.probes.len());

        for probe in &self.probes {
            let mut state = NodeState {
                fingerprint: Fingerprint::new(0, 0),
                last: Instant::now(),
                next_seq: 0,
                failing: false,
            };
            match self.initial(probe).await {
                Ok(sample) => {
                    append(sink, &sample)?;
                    *stats.per_node.entry(probe.node.clone()).or_default() += 1;
                    stats.total += 1;
                    state.fingerprint = sample.fingerprint;
                    state.next_seq = 1;
                }
                Err(e) => {
                    warn!(target: "fleet.sampler", node = %probe.node, error = %e, "initial snapshot failed");
                    stats.skipped += 1;
                    state.failing = true;
                }
            }
            states.push(state);
        }
        info!(target: "fleet.sampler", nodes = self.probes.len(), duration_s = self.cfg.duration.as_secs_f64(), "sampling started");

        let end = started + self.cfg.duration;
        loop {
            if Instant::now() >= end {
                break;
            }
            for (probe, state) in self.probes.iter().zip(states.iter_mut()) {
                let sample = match self.poll(probe, state).await {
                    Ok(Some(sample)) => sample,
                    Ok(None) => continue,
                    Err(e) => {
                        stats.skipped += 1;
                        if !state.failing {
                            warn!(target: "fleet.sampler", node = %probe.node, error = %e, "probe failed");
                        }
                        state.failing = true;
                        continue;
                    }
                };
                append(sink, &sample)?;

                let now = Instant::now();
                if state.next_seq > 0 {
                    stats.max_gap = stats.max_gap.max(now - state.last);
                }
                *stats.per_node.entry(probe.node.clone()).or_default() += 1;
                stats.total += 1;
                state.fingerprint = sample.fingerprint;
                state.last = now;
                state.next_seq += 1;
                state.failing = false;
            }

            let left = end.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(target: "fleet.sampler", "sampling cancelled");
                    break;
                }
                _ = sleep(self.cfg.sweep.min(left)) => {}
            }
        }

        stats.elapsed = started.elapsed();
        Ok(stats)
    }

    async fn initial(&self, probe: &NodeProbe) -> Result<Sample, SamplerError> {
        let fp = fingerprint(&probe.counter)
            .await
            .map_err(|e| probe_error(&probe.counter, e))?;
        self.snapshot(probe, 0, fp).await
    }

    /// A sample if the node's counter changed or its heartbeat is due.
    ///
    /// A node without any sample yet is always sampled.
    async fn poll(&self, probe: &NodeProbe, state: &NodeState) -> Result<Option<Sample>, SamplerError> {
        let fp = fingerprint(&probe.counter)
            .await
            .map_err(|e| probe_error(&probe.counter, e))?;
        if state.next_seq == 0 {
            return self.snapshot(probe, 0, fp).await.map(Some);
        }
        if fp < state.fingerprint {
            warn!(
                target: "fleet.sampler",
                node = %probe.node,
                previous = %state.fingerprint,
                current = %fp,
                "counter fingerprint went backwards"
            );
        }
        let due = Instant::now() - state.last >= self.cfg.heartbeat;
        if fp == state.fingerprint && !due {
            return Ok(None);
        }
        self.snapshot(probe, state.next_seq, fp).await.map(Some)
    }

    async fn snapshot(&self, probe: &NodeProbe, seq: u64, fp: Fingerprint) -> Result<Sample, SamplerError> {
        let timestamp = SystemTime::now();
        let reading = first_line(&probe.counter)
            .await
            .map_err(|e| probe_error(&probe.counter, e))?;
        let stat = first_line(&probe.cpu_stat)
            .await
            .map_err(|e| probe_error(&probe.cpu_stat, e))?;
        let (user_ticks, system_ticks) = parse_pid_stat(&stat).ok_or_else(|| SamplerError::Probe {
            path: probe.cpu_stat.clone(),
            reason: "malformed stat line".into(),
        })?;
        let host_ticks = match &self.cfg.host_stat {
            Some(path) => {
                let line = first_line(path).await.map_err(|e| probe_error(path, e))?;
                parse_host_stat(&line)
            }
            None => None,
        };
        Ok(Sample {
            node: probe.node.clone(),
            seq,
            fingerprint: fp,
            reading,
            user_ticks,
            system_ticks,
            host_ticks,
            timestamp,
        })
    }
}

/// Sink writes block. On a multi-thread runtime the worker is handed over
/// while they run.
fn append<S: SampleSink>(sink: &mut S, sample: &Sample) -> Result<(), SamplerError> {
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => task::block_in_place(|| sink.append(sample)),
        _ => sink.append(sample),
    }
}

fn probe_error(path: &std::path::Path, e: std::io::Error) -> SamplerError {
    SamplerError::Probe {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const STAT: &str = "77 (qemu) S 1 77 77 0 -1 0 0 0 0 0 10 5 0 0 20 0 1 0 1";

    fn node_files(dir: &Path, name: &str) -> NodeProbe {
        let counter = dir.join(name).join("energy_uj");
        std::fs::create_dir_all(counter.parent().unwrap()).unwrap();
        std::fs::write(&counter, "1000\n").unwrap();
        let stat = dir.join(format!("{name}.stat"));
        std::fs::write(&stat, STAT).unwrap();
        NodeProbe::new(name, counter, stat)
    }

    fn quick(duration_ms: u64, heartbeat_ms: u64, sweep_ms: u64) -> SamplerConfig {
        SamplerConfig {
            duration: Duration::from_millis(duration_ms),
            heartbeat: Duration::from_millis(heartbeat_ms),
            sweep: Duration::from_millis(sweep_ms),
            host_stat: None,
            ready_timeout: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn change_is_sampled_between_heartbeats() {
        let dir = tempfile::tempdir().unwrap();
        let probe = node_files(dir.path(), "cloud0");
        let counter = probe.counter.clone();
        let sampler = Sampler::new(quick(1000, 100, 10), vec![probe]).unwrap();

        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            // Replace atomically so no sweep observes a truncated file.
            let staged = counter.with_extension("next");
            std::fs::write(&staged, "2000\n").unwrap();
            std::fs::rename(&staged, &counter).unwrap();
        });
        let mut samples: Vec<Sample> = Vec::new();
        let stats = sampler.run(&mut samples).await.unwrap();
        writer.await.unwrap();

        let initial = samples[0].fingerprint;
        let before: Vec<&Sample> = samples.iter().filter(|s| s.fingerprint == initial).collect();
        let after: Vec<&Sample> = samples.iter().filter(|s| s.fingerprint != initial).collect();

        assert!(before.len() >= 3, "initial snapshot plus at least two heartbeats");
        assert!(before.iter().all(|s| s.reading == "1000"));
        assert_eq!(after[0].reading, "2000");
        assert!(after.len() >= 2, "heartbeats continue after the change");
        assert!(after.iter().all(|s| s.fingerprint == after[0].fingerprint));

        let seqs: Vec<u64> = samples.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, (0..samples.len() as u64).collect::<Vec<_>>());
        assert!(stats.total >= 10);
        assert_eq!(stats.total, samples.len() as u64);
        assert!(stats.max_gap < Duration::from_millis(200));
        assert_eq!((samples[0].user_ticks, samples[0].system_ticks), (10, 5));
    }

    #[tokio::test]
    async fn nodes_are_sampled_independently() {
        let dir = tempfile::tempdir().unwrap();
        let a = node_files(dir.path(), "cloud0");
        let b = node_files(dir.path(), "cloud1");
        let log_path = dir.path().join("0_1.jsonl");
        let sampler = Sampler::new(quick(300, 50, 10), vec![a, b]).unwrap();

        let mut log = SampleLog::create(&log_path).unwrap();
        let stats = sampler.run(&mut log).await.unwrap();

        let grouped = SampleLog::replay_by_node(&log_path).unwrap();
        assert_eq!(grouped.len(), 2);
        for (node, samples) in &grouped {
            assert_eq!(samples[0].seq, 0);
            assert!(samples.windows(2).all(|w| w[1].seq == w[0].seq + 1));
            assert_eq!(stats.per_node[node], samples.len() as u64);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreadable_node_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let a = node_files(dir.path(), "cloud0");
        let b = node_files(dir.path(), "cloud1");
        let b_stat = b.cpu_stat.clone();
        std::fs::remove_file(&b_stat).unwrap();
        let log_path = dir.path().join("0_1.jsonl");
        let sampler = Sampler::new(quick(600, 50, 10), vec![a, b]).unwrap();

        let late = tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            std::fs::write(&b_stat, STAT).unwrap();
        });
        let mut log = SampleLog::create(&log_path).unwrap();
        let stats = sampler.run(&mut log).await.unwrap();
        late.await.unwrap();

        assert!(stats.skipped > 0);
        let grouped = SampleLog::replay_by_node(&log_path).unwrap();
        let a_samples = &grouped[&NodeId::from("cloud0")];
        let b_samples = &grouped[&NodeId::from("cloud1")];
        assert!(a_samples.len() > b_samples.len());
        assert_eq!(b_samples[0].seq, 0, "first readable poll is the snapshot");
        assert!(b_samples.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    }

    #[tokio::test]
    async fn fingerprint_going_backwards_is_still_sampled() {
        let dir = tempfile::tempdir().unwrap();
        let probe = node_files(dir.path(), "cloud0");
        let sampler = Sampler::new(quick(100, 60_000, 10), vec![probe.clone()]).unwrap();
        let state = NodeState {
            fingerprint: Fingerprint::new(i64::MAX / 2, 0),
            last: Instant::now(),
            next_seq: 4,
            failing: false,
        };

        let sample = sampler.poll(&probe, &state).await.unwrap().unwrap();
        assert_eq!(sample.seq, 4);
        assert!(sample.fingerprint < state.fingerprint);
    }

    #[tokio::test]
    async fn cancellation_ends_sampling_early() {
        let dir = tempfile::tempdir().unwrap();
        let sampler = Sampler::new(quick(60_000, 100, 10), vec![node_files(dir.path(), "cloud0")]).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let mut samples: Vec<Sample> = Vec::new();
        let stats = sampler.run_until(&mut samples, &cancel).await.unwrap();
        assert!(stats.elapsed < Duration::from_secs(5));
        assert!(!samples.is_empty());
    }

    #[tokio::test]
    async fn wait_ready_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let missing = NodeProbe::new("cloud9", dir.path().join("nope"), dir.path().join("stat"));
        let sampler = Sampler::new(quick(100, 50, 10), vec![missing]).unwrap();

        assert!(matches!(
            sampler.wait_ready().await,
            Err(SamplerError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn wait_ready_sees_late_counters() {
        let dir = tempfile::tempdir().unwrap();
        let probe = NodeProbe::new("cloud0", dir.path().join("energy_uj"), dir.path().join("stat"));
        let path = probe.counter.clone();
        let sampler = Sampler::new(quick(100, 50, 10), vec![probe]).unwrap();

        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            std::fs::write(path, "1\n").unwrap();
        });
        sampler.wait_ready().await.unwrap();
    }

    #[test]
    fn empty_inventory_is_rejected() {
        assert!(matches!(
            Sampler::new(SamplerConfig::default(), Vec::new()),
            Err(SamplerError::NoNodes)
        ));
    }
}
