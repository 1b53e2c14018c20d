use std::{path::{Path, PathBuf}, time::Duration};

use fleet_core::{SamplerConfig, StageTimeouts};
use fleet_observe::LoggerConfig;
use fleet_session::SshConfig;
use fleet_stages::StageSettings;
use serde::Deserialize;

use crate::error::RunnerError;

/// Remote shell settings. The login user of a node is its VM name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SshSettings {
    pub program: String,
    pub identity: Option<PathBuf>,
    pub options: Vec<String>,
    /// Bound for the first barrier on a new session; `0` disables the probe.
    pub connect_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            program: "ssh".into(),
            identity: None,
            options: Vec::new(),
            connect_timeout_secs: 60,
        }
    }
}

impl SshSettings {
    pub fn to_ssh_config(&self) -> SshConfig {
        SshConfig {
            program: self.program.clone(),
            identity: self.identity.clone(),
            options: self.options.clone(),
            connect_timeout: secs_opt(self.connect_timeout_secs),
            barrier_timeout: None,
        }
    }
}

/// Host-side command started before stages run, e.g. the energy exporter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Output line (substring) that signals readiness.
    pub ready_line: String,
    #[serde(default = "default_ready_secs")]
    pub ready_timeout_secs: u64,
}

impl LocalCommand {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

fn default_ready_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutSettings {
    pub readiness_secs: u64,
    pub install_secs: u64,
    pub start_secs: u64,
    pub counters_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let t = StageTimeouts::default();
        Self {
            readiness_secs: t.readiness.as_secs(),
            install_secs: t.install.as_secs(),
            start_secs: t.start.as_secs(),
            counters_secs: 120,
        }
    }
}

impl TimeoutSettings {
    pub fn stage_timeouts(&self) -> StageTimeouts {
        StageTimeouts {
            readiness: Duration::from_secs(self.readiness_secs),
            install: Duration::from_secs(self.install_secs),
            start: Duration::from_secs(self.start_secs),
        }
    }
}

/// Pauses between run phases, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Cooldowns {
    pub after_provision: u64,
    pub after_exporter: u64,
    pub after_setup: u64,
    pub between_runs: u64,
}

impl Default for Cooldowns {
    fn default() -> Self {
        Self {
            after_provision: 3,
            after_exporter: 1,
            after_setup: 1,
            between_runs: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunnerConfig {
    pub ssh: SshSettings,
    /// Directory the exporter writes per-VM counters to.
    pub counter_root: PathBuf,
    pub results_dir: PathBuf,
    /// Directory of the provisioning tool's logs; the newest `.log` is the inventory.
    pub provisioning_log_dir: PathBuf,
    /// Files written to nodes by stages.
    pub assets_dir: PathBuf,
    /// JSON plan table merged over the built-in one.
    pub plan_table: Option<PathBuf>,
    /// Sampling duration per run, in seconds.
    pub measure_interval: u64,
    pub runs: u32,
    pub experiments: Vec<String>,
    pub keep_vms: bool,
    /// Owner column of VM processes in `ps -ef`.
    pub vm_owner: String,
    /// Started per run before `exporter`; `None` means the VMs are already up.
    pub provision: Option<LocalCommand>,
    pub exporter: Option<LocalCommand>,
    /// Start the load generator on the controller node after setup.
    pub workload: bool,
    /// Delete random benchmark pods while measuring.
    pub disruption: bool,
    pub timeouts: TimeoutSettings,
    pub cooldowns: Cooldowns,
    pub host_stat: Option<PathBuf>,
    pub stages: StageSettings,
    pub logger: LoggerConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ssh: SshSettings::default(),
            counter_root: PathBuf::from("/var/lib/libvirt/scaphandre"),
            results_dir: PathBuf::from("res"),
            provisioning_log_dir: PathBuf::from("logs"),
            assets_dir: PathBuf::from("assets"),
            plan_table: None,
            measure_interval: 300,
            runs: 5,
            experiments: Vec::new(),
            keep_vms: false,
            vm_owner: "libvirt+".into(),
            provision: None,
            exporter: None,
            workload: true,
            disruption: true,
            timeouts: TimeoutSettings::default(),
            cooldowns: Cooldowns::default(),
            host_stat: Some(PathBuf::from("/proc/stat")),
            stages: StageSettings::default(),
            logger: LoggerConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let raw = std::fs::read_to_string(path).map_err(|e| RunnerError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&raw).map_err(|e| RunnerError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            duration: Duration::from_secs(self.measure_interval),
            host_stat: self.host_stat.clone(),
            ready_timeout: Duration::from_secs(self.timeouts.counters_secs),
            ..SamplerConfig::default()
        }
    }
}

fn secs_opt(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
