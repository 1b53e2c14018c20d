use std::time::Duration;

use serde::Deserialize;

/// Services of the social-network benchmark, one pod each.
pub const SOCIAL_NETWORK_PODS: [&str; 27] = [
    "compose-post-service",
    "home-timeline-redis",
    "home-timeline-service",
    "jaeger",
    "media-frontend",
    "media-memcached",
    "media-mongodb",
    "media-service",
    "nginx-thrift",
    "post-storage-memcached",
    "post-storage-mongodb",
    "post-storage-service",
    "social-graph-mongodb",
    "social-graph-redis",
    "social-graph-service",
    "text-service",
    "unique-id-service",
    "url-shorten-memcached",
    "url-shorten-mongodb",
    "url-shorten-service",
    "user-memcached",
    "user-mention-service",
    "user-mongodb",
    "user-service",
    "user-timeline-mongodb",
    "user-timeline-redis",
    "user-timeline-service",
];

/// Services that take long to come back and are never disrupted.
pub const SLOW_STARTING_PODS: [&str; 2] = ["media-frontend", "nginx-thrift"];

/// Load generator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadSettings {
    pub threads: u32,
    pub connections: u32,
    #[serde(with = "secs")]
    pub duration: Duration,
    pub requests_per_sec: u32,
    pub script: String,
    pub url: String,
    /// Service forwarded to `localhost:port` before the load starts.
    pub frontend: String,
    pub port: u16,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            threads: 8,
            connections: 64,
            duration: Duration::from_secs(6000),
            requests_per_sec: 2056,
            script: "~/DeathStarBench/socialNetwork/wrk2/scripts/social-network/read-home-timeline.lua"
                .into(),
            url: "http://localhost:8080/wrk2-api/home-timeline/read".into(),
            frontend: "svc/nginx-thrift".into(),
            port: 8080,
        }
    }
}

impl WorkloadSettings {
    pub fn command(&self) -> String {
        format!(
            "wrk -D exp -t {} -c {} -d {}s -L -s {} {} -R {}",
            self.threads,
            self.connections,
            self.duration.as_secs(),
            self.script,
            self.url,
            self.requests_per_sec
        )
    }
}

/// Parameters of the built-in stages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StageSettings {
    /// Guest mount point of the host-shared folder.
    pub shared_dir: String,
    /// virtiofs tag of the host-shared folder.
    pub shared_tag: String,
    pub exporter_version: String,
    pub benchmark_version: String,
    /// Address the prometheus port-forward binds to; `None` keeps kubectl's default.
    pub prometheus_address: Option<String>,
    /// Cores spun by the host CPU burn when the plan gives no count.
    pub burn_cores: u32,
    /// Burner binary, reachable by the guest through the shared folder.
    pub burn_binary: String,
    pub workload: WorkloadSettings,
    /// Pods whose readiness gates the benchmark install.
    pub benchmark_pods: Vec<String>,
    /// Pods the disruption task may delete.
    pub disruptable_pods: Vec<String>,
    #[serde(with = "secs")]
    pub disruption_interval: Duration,
    pub disruption_kills: usize,
    pub disruption_seed: u64,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            shared_dir: "/var/scaphandre".into(),
            shared_tag: "scaphandre".into(),
            exporter_version: "v1.0.0".into(),
            benchmark_version: "socialNetwork-0.3.2".into(),
            prometheus_address: Some("192.168.221.2".into()),
            burn_cores: 2,
            burn_binary: "/var/scaphandre/fleet-burn".into(),
            workload: WorkloadSettings::default(),
            benchmark_pods: SOCIAL_NETWORK_PODS.iter().map(|s| s.to_string()).collect(),
            disruptable_pods: SOCIAL_NETWORK_PODS
                .iter()
                .filter(|p| !SLOW_STARTING_PODS.contains(*p))
                .map(|s| s.to_string())
                .collect(),
            disruption_interval: Duration::from_secs(60),
            disruption_kills: 3,
            disruption_seed: 1,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_pods_are_never_disruptable() {
        let s = StageSettings::default();
        assert_eq!(s.benchmark_pods.len(), 27);
        assert_eq!(s.disruptable_pods.len(), 25);
        assert!(!s.disruptable_pods.iter().any(|p| p == "nginx-thrift"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: StageSettings =
            serde_json::from_str(r#"{ "burnCores": 4, "workload": { "requestsPerSec": 100, "duration": 30 } }"#)
                .unwrap();
        assert_eq!(s.burn_cores, 4);
        assert_eq!(s.workload.requests_per_sec, 100);
        assert_eq!(s.workload.duration, Duration::from_secs(30));
        assert_eq!(s.workload.threads, 8);
        assert_eq!(s.exporter_version, "v1.0.0");
    }

    #[test]
    fn workload_command_line() {
        let cmd = WorkloadSettings::default().command();
        assert!(cmd.starts_with("wrk -D exp -t 8 -c 64 -d 6000s -L -s "));
        assert!(cmd.ends_with("/wrk2-api/home-timeline/read -R 2056"));
    }
}
