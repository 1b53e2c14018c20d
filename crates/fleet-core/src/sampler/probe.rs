use std::{
    io,
    path::{Path, PathBuf},
};

use fleet_model::{Fingerprint, NodeId};

/// External-state locations of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeProbe {
    pub node: NodeId,
    /// Energy counter file rewritten by the exporter.
    pub counter: PathBuf,
    /// `/proc/<pid>/stat` of the node's VM process.
    pub cpu_stat: PathBuf,
}

impl NodeProbe {
    pub fn new(node: impl Into<NodeId>, counter: impl Into<PathBuf>, cpu_stat: impl Into<PathBuf>) -> Self {
        Self {
            node: node.into(),
            counter: counter.into(),
            cpu_stat: cpu_stat.into(),
        }
    }

    /// Probe for VM `node` running as `pid`, with counters under `counter_root`.
    pub fn for_vm(node: impl Into<NodeId>, pid: i32, counter_root: &Path) -> Self {
        let node = node.into();
        let counter = counter_root
            .join(node.as_str())
            .join("intel-rapl:0")
            .join("energy_uj");
        Self {
            node,
            counter,
            cpu_stat: PathBuf::from(format!("/proc/{pid}/stat")),
        }
    }
}

/// Status-change time of `path`.
#[cfg(unix)]
pub async fn fingerprint(path: &Path) -> io::Result<Fingerprint> {
    use std::os::unix::fs::MetadataExt;

    let meta = tokio::fs::metadata(path).await?;
    Ok(Fingerprint::new(meta.ctime(), meta.ctime_nsec() as u32))
}

/// Modification time of `path`.
#[cfg(not(unix))]
pub async fn fingerprint(path: &Path) -> io::Result<Fingerprint> {
    let meta = tokio::fs::metadata(path).await?;
    let since = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(Fingerprint::new(since.as_secs() as i64, since.subsec_nanos()))
}

pub async fn first_line(path: &Path) -> io::Result<String> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(content.lines().next().unwrap_or_default().trim().to_string())
}

/// `(utime, stime)` from a `/proc/<pid>/stat` line.
///
/// Fields are counted after the parenthesised command name, which may
/// itself contain spaces.
pub fn parse_pid_stat(line: &str) -> Option<(u64, u64)> {
    let rest = &line[line.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(11);
    let utime = fields.next()?.parse().ok()?;
    let stime = fields.next()?.parse().ok()?;
    Some((utime, stime))
}

/// User plus nice ticks of the aggregate `cpu` line of `/proc/stat`.
pub fn parse_host_stat(line: &str) -> Option<u64> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let user: u64 = fields.next()?.parse().ok()?;
    let nice: u64 = fields.next()?.parse().ok()?;
    Some(user + nice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_stat_fields_follow_the_command_name() {
        let line = "4711 (qemu-system-x86) S 1 4711 4711 0 -1 4194624 9 0 0 0 1234 567 0 0 20 0 5 0 100";
        assert_eq!(parse_pid_stat(line), Some((1234, 567)));

        let spaced = "99 (a b) c) R 1 99 99 0 -1 0 0 0 0 0 7 8 0 0";
        assert_eq!(parse_pid_stat(spaced), Some((7, 8)));

        assert_eq!(parse_pid_stat("99 (short) R 1"), None);
    }

    #[test]
    fn host_stat_sums_user_and_nice() {
        assert_eq!(parse_host_stat("cpu  100 20 300 4000 0 0 0 0 0 0"), Some(120));
        assert_eq!(parse_host_stat("cpu0 1 2 3"), None);
    }

    #[test]
    fn vm_probe_paths() {
        let p = NodeProbe::for_vm("cloud0", 321, Path::new("/var/lib/libvirt/scaphandre"));
        assert_eq!(
            p.counter,
            PathBuf::from("/var/lib/libvirt/scaphandre/cloud0/intel-rapl:0/energy_uj")
        );
        assert_eq!(p.cpu_stat, PathBuf::from("/proc/321/stat"));
    }

    #[tokio::test]
    async fn fingerprint_moves_when_the_file_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("energy_uj");
        std::fs::write(&path, "1\n").unwrap();
        let before = fingerprint(&path).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        std::fs::write(&path, "2\n").unwrap();

        assert!(fingerprint(&path).await.unwrap() > before);
        assert_eq!(first_line(&path).await.unwrap(), "2");
    }
}
