//! Node inventory and VM process discovery on the host.
use std::path::{Path, PathBuf};

use fleet_model::NodeTarget;
use tokio::process::Command;
use tracing::debug;

use crate::error::RunnerError;

/// Newest `.log` file in `dir`.
///
/// Log names embed their creation time, so the lexicographically last one wins.
pub fn latest_log(dir: &Path) -> Result<PathBuf, RunnerError> {
    let mut logs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .collect();
    logs.sort();
    logs.pop().ok_or_else(|| RunnerError::NoLog(dir.to_path_buf()))
}

/// Nodes from `ssh <vm>@<host> -i <key>` hints printed by the provisioning tool.
///
/// The first node listed is the controller.
pub fn parse_inventory(log: &str) -> Vec<NodeTarget> {
    log.lines()
        .map(str::trim)
        .filter(|l| l.starts_with("ssh ") && l.contains(" -i "))
        .filter_map(|l| l.split_whitespace().nth(1)?.split_once('@'))
        .enumerate()
        .map(|(index, (vm, host))| NodeTarget::new(index, vm, host))
        .collect()
}

pub fn load_inventory(dir: &Path) -> Result<Vec<NodeTarget>, RunnerError> {
    let log = latest_log(dir)?;
    let nodes = parse_inventory(&std::fs::read_to_string(&log)?);
    if nodes.is_empty() {
        return Err(RunnerError::EmptyInventory(log));
    }
    debug!(target: "fleet.runner.inventory", log = %log.display(), nodes = nodes.len(), "inventory loaded");
    Ok(nodes)
}

pub async fn process_table() -> Result<String, RunnerError> {
    let out = Command::new("ps").arg("-ef").output().await?;
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

fn guest_name(line: &str) -> Option<&str> {
    line.split_whitespace()
        .find_map(|arg| arg.strip_prefix("guest="))
        .map(|rest| rest.split(',').next().unwrap_or(rest))
}

/// Pid of each VM in `names`, from `ps -ef` output.
pub fn vm_pids(ps: &str, owner: &str, names: &[&str]) -> Result<Vec<i32>, RunnerError> {
    let mut pids = vec![0; names.len()];
    for line in ps.lines().filter(|l| is_vm_line(l, owner)) {
        let Some(guest) = guest_name(line) else {
            continue;
        };
        let Some(idx) = names.iter().position(|n| *n == guest) else {
            continue;
        };
        if let Some(pid) = line.split_whitespace().nth(1).and_then(|p| p.parse().ok()) {
            pids[idx] = pid;
        }
    }
    match names.iter().zip(&pids).find(|(_, pid)| **pid <= 0) {
        Some((name, _)) => Err(RunnerError::MissingVm(name.to_string())),
        None => Ok(pids),
    }
}

/// Number of VM processes on the host, experiment or not.
pub fn active_vm_count(ps: &str, owner: &str) -> usize {
    ps.lines().filter(|l| is_vm_line(l, owner)).count()
}

fn is_vm_line(line: &str, owner: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|user| user.contains(owner))
}
