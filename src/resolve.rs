//! Container to host PID resolution and namespace crossing binary lookup.
//!
//! A privileged process in the host PID namespace sees every container's
//! processes. `/proc/<pid>/cgroup` names the container a process belongs to
//! and `/proc/<pid>/root` exposes that process's root filesystem.

use std::fs;
use std::path::PathBuf;

use log::{debug, trace};

use crate::error::{CaptureError, TransportError};
use crate::transport::{quote, Channel};

pub type Pid = u32;

/// Strip the runtime scheme from ids like `containerd://4f2a...`.
pub fn normalize_container_id(id: &str) -> &str {
    match id.split_once("://") {
        Some((_, rest)) => rest,
        None => id,
    }
    .trim()
}

/// `/proc/<pid>/root` prefixed in-container path.
pub fn root_path(pid: Pid, in_container_path: &str) -> String {
    let path = in_container_path.trim_start_matches('/');
    format!("/proc/{pid}/root/{path}")
}

fn pid_of(entry: &str) -> Option<Pid> {
    // `self` and `thread-self` fail to parse and drop out here.
    entry.parse().ok()
}

pub trait ProcessResolver {
    /// Host PIDs whose cgroup mentions `container_id`, sorted and deduplicated.
    fn resolve_pids(&self, container_id: &str) -> Result<Vec<Pid>, CaptureError>;

    /// The first PID, in the order given, whose root filesystem contains
    /// `in_container_path`.
    fn resolve_binary_path(
        &self,
        candidate_pids: &[Pid],
        in_container_path: &str,
    ) -> Result<Option<(String, Pid)>, CaptureError>;
}

fn checked_id(container_id: &str) -> Result<&str, CaptureError> {
    let id = normalize_container_id(container_id);
    if id.is_empty() {
        return Err(CaptureError::InvalidRequest(format!(
            "empty container id {container_id:?}"
        )));
    }
    Ok(id)
}

/// Resolver reading a procfs mounted at `root`.
#[derive(Debug, Clone)]
pub struct LocalProc {
    root: PathBuf,
}

impl Default for LocalProc {
    fn default() -> Self {
        LocalProc::new("/proc")
    }
}

impl LocalProc {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalProc { root: root.into() }
    }

    fn pid_root_path(&self, pid: Pid, in_container_path: &str) -> PathBuf {
        self.root
            .join(pid.to_string())
            .join("root")
            .join(in_container_path.trim_start_matches('/'))
    }
}

impl ProcessResolver for LocalProc {
    fn resolve_pids(&self, container_id: &str) -> Result<Vec<Pid>, CaptureError> {
        let id = checked_id(container_id)?;
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(pid_of) else {
                continue;
            };
            // Processes exit while we scan.
            match fs::read_to_string(entry.path().join("cgroup")) {
                Ok(cgroup) if cgroup.contains(id) => pids.push(pid),
                Ok(_) => {}
                Err(e) => trace!("skipping pid {pid}: {e}"),
            }
        }
        pids.sort_unstable();
        pids.dedup();
        debug!("container {} has pids {:?}", id, pids);
        Ok(pids)
    }

    fn resolve_binary_path(
        &self,
        candidate_pids: &[Pid],
        in_container_path: &str,
    ) -> Result<Option<(String, Pid)>, CaptureError> {
        Ok(candidate_pids.iter().find_map(|pid| {
            let path = self.pid_root_path(*pid, in_container_path);
            path.is_file()
                .then(|| (path.to_string_lossy().into_owned(), *pid))
        }))
    }
}

/// Resolver running shell commands over a [`Channel`].
pub struct RemoteProc<'a, C: Channel + ?Sized> {
    channel: &'a C,
}

impl<'a, C: Channel + ?Sized> RemoteProc<'a, C> {
    pub fn new(channel: &'a C) -> Self {
        RemoteProc { channel }
    }
}

fn parse_cgroup_matches(stdout: &str) -> Vec<Pid> {
    let mut pids: Vec<Pid> = stdout
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("/proc/")?;
            let (pid, file) = rest.split_once('/')?;
            (file == "cgroup").then_some(pid).and_then(pid_of)
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

impl<C: Channel + ?Sized> ProcessResolver for RemoteProc<'_, C> {
    fn resolve_pids(&self, container_id: &str) -> Result<Vec<Pid>, CaptureError> {
        let id = checked_id(container_id)?;
        let command = format!("grep -l -F -e {} /proc/*/cgroup 2>/dev/null", quote(id)?);
        let output = self.channel.run(&command)?;
        // grep exits 1 for no match and 2 when a process vanished mid scan.
        if !matches!(output.status, Some(0..=2)) {
            return Err(TransportError::CommandFailed {
                command,
                status: output.status,
                stderr: output.stderr_lossy(),
            }
            .into());
        }
        let pids = parse_cgroup_matches(&output.stdout_lossy());
        debug!(
            "container {} has pids {:?} on {}",
            id,
            pids,
            self.channel.destination()
        );
        Ok(pids)
    }

    fn resolve_binary_path(
        &self,
        candidate_pids: &[Pid],
        in_container_path: &str,
    ) -> Result<Option<(String, Pid)>, CaptureError> {
        for pid in candidate_pids {
            let path = root_path(*pid, in_container_path);
            let output = self.channel.run(&format!("test -f {}", quote(&path)?))?;
            if output.success() {
                return Ok(Some((path, *pid)));
            }
        }
        Ok(None)
    }
}
