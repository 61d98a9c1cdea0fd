//! perf against a Kubernetes pod or node through a helper pod.
//!
//! The helper runs privileged in the host PID namespace on the target's
//! node. We reach it over ssh tunnelled through `kubectl exec`, find the
//! target's host PIDs from its container ids and attach perf to them.
//! Binaries are read back through `/proc/<pid>/root` so container paths
//! resolve inside the right mount namespace.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::remote::{collect_remote, read_remote_binary, run_remote_perf};
use super::{Backend, CancelToken, CollectedTrace, RunOutput};
use crate::config::Config;
use crate::error::{CaptureError, KubeError, Result, TransportError};
use crate::kube::{await_ready, helper_pod_name, random_suffix, HelperPod, HelperPodSpec, PodLifecycle};
use crate::perf_cmd::{CaptureRequest, PerfCommand, Target};
use crate::record::{RunKind, TargetInfo};
use crate::resolve::{Pid, ProcessResolver, RemoteProc};
use crate::transport::{join, Channel, SshOptions};
use crate::trust::EphemeralTrust;

/// What to attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    /// Every process of every container in the pod.
    Pod { name: String },
    /// Host PIDs on a node, or the whole node when `pids` is empty.
    Node { name: String, pids: Vec<Pid> },
}

impl AttachTarget {
    fn name(&self) -> &str {
        match self {
            AttachTarget::Pod { name } | AttachTarget::Node { name, .. } => name,
        }
    }
}

/// Opens the ssh channel to the helper.
pub type Connect<C> = fn(&str, SshOptions) -> std::result::Result<C, TransportError>;

pub struct AttachBackend<P: PodLifecycle, C: Channel> {
    pods: Arc<P>,
    target: AttachTarget,
    connect: Connect<C>,
    image: String,
    ready_timeout: Duration,
    poll_interval: Duration,
    control_dir: PathBuf,
    control_persist: String,
    keep: bool,
    session: String,
    info: TargetInfo,
    pids: Vec<Pid>,
    // Released in reverse order of creation by `cleanup`.
    helper: Option<HelperPod<P>>,
    trust: Option<EphemeralTrust<P>>,
    channel: Option<C>,
    work_dir_created: bool,
    script: Option<PathBuf>,
}

impl<P: PodLifecycle, C: Channel> AttachBackend<P, C> {
    pub fn new(pods: Arc<P>, target: AttachTarget, connect: Connect<C>, config: &Config) -> Result<Self> {
        let image = config.helper_image.clone().ok_or_else(|| {
            CaptureError::InvalidRequest("attaching needs a helper image".to_string())
        })?;
        let info = TargetInfo {
            namespace: Some(pods.namespace().to_string()),
            pod: match &target {
                AttachTarget::Pod { name } => Some(name.clone()),
                AttachTarget::Node { .. } => None,
            },
            node: match &target {
                AttachTarget::Node { name, .. } => Some(name.clone()),
                AttachTarget::Pod { .. } => None,
            },
            ..Default::default()
        };
        Ok(AttachBackend {
            pods,
            target,
            connect,
            image,
            ready_timeout: config.ready_timeout,
            poll_interval: config.poll_interval,
            control_dir: config.control_dir(),
            control_persist: config.control_persist.clone(),
            keep: config.keep,
            session: random_suffix(),
            info,
            pids: Vec::new(),
            helper: None,
            trust: None,
            channel: None,
            work_dir_created: false,
            script: None,
        })
    }

    /// Remote scratch directory of this session.
    pub fn work_dir(&self) -> String {
        format!("/tmp/perfcap-{}", self.session)
    }

    fn data_path(&self) -> String {
        format!("{}/perf.data", self.work_dir())
    }

    fn channel(&self) -> Result<&C> {
        self.channel
            .as_ref()
            .ok_or_else(|| CaptureError::InvalidRequest("session was not prepared".into()))
    }

    /// Node of the target and the container ids whose processes to find.
    fn locate(&self) -> Result<(String, Vec<String>)> {
        match &self.target {
            AttachTarget::Pod { name } => {
                let pod = self.pods.get_pod(name)?;
                let node = pod
                    .spec
                    .node_name
                    .clone()
                    .ok_or_else(|| KubeError::NotScheduled(name.clone()))?;
                let ids: Vec<String> = pod.container_ids().into_iter().map(|(_, id)| id).collect();
                if ids.is_empty() {
                    return Err(KubeError::NoContainers(name.clone()).into());
                }
                debug!("pod {name} runs on {node} with containers {ids:?}");
                Ok((node, ids))
            }
            AttachTarget::Node { name, .. } => Ok((name.clone(), Vec::new())),
        }
    }

    fn resolve_pids(&self, channel: &C, container_ids: &[String]) -> Result<Vec<Pid>> {
        let resolver = RemoteProc::new(channel);
        let mut pids = Vec::new();
        for id in container_ids {
            for pid in resolver.resolve_pids(id)? {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }
        Ok(pids)
    }
}

impl<P: PodLifecycle, C: Channel> Backend for AttachBackend<P, C> {
    fn kind(&self) -> RunKind {
        RunKind::Attach
    }

    fn target_info(&self) -> TargetInfo {
        self.info.clone()
    }

    fn prepare(&mut self, request: &CaptureRequest, cancel: &CancelToken) -> Result<PerfCommand> {
        if matches!(request.target, Target::Launch { .. }) {
            return Err(CaptureError::InvalidRequest(
                "attach sessions observe running processes and cannot launch a binary".into(),
            ));
        }

        let (node, container_ids) = self.locate()?;
        self.info.node = Some(node.clone());
        match self.pods.get_node(&node) {
            Ok(n) => {
                self.info.os = Some(n.status.node_info.operating_system);
                self.info.arch = Some(n.status.node_info.architecture);
            }
            Err(e) => warn!("could not read node {node}: {e}"),
        }
        cancel.check()?;

        let spec = HelperPodSpec {
            name: helper_pod_name(self.target.name(), &self.session),
            image: self.image.clone(),
            node_name: node,
        };
        let helper = self.helper.insert(HelperPod::create(self.pods.clone(), &spec, self.keep)?);
        let helper_name = helper.name().to_string();
        await_ready(
            &*self.pods,
            &helper_name,
            self.ready_timeout,
            self.poll_interval,
            cancel,
        )?;
        info!("helper pod {helper_name} is ready");

        let trust = self.trust.insert(EphemeralTrust::provision(self.pods.clone(), &helper_name)?);
        let destination = trust.destination();
        let mut options = trust
            .ssh_options(self.control_dir.clone())
            .control_key(self.session.clone());
        options.control_persist.clone_from(&self.control_persist);
        cancel.check()?;
        let work_dir = self.work_dir();
        let channel = self.channel.insert((self.connect)(&destination, options)?);
        channel.run_checked(&join(["mkdir", "-p", work_dir.as_str()])?)?;
        self.work_dir_created = true;

        let target = match &self.target {
            AttachTarget::Pod { name } => {
                let pids = self.resolve_pids(self.channel()?, &container_ids)?;
                if pids.is_empty() {
                    return Err(CaptureError::NoProcesses(format!("pod {name}")));
                }
                info!("attaching to pod {name} pids {pids:?}");
                Target::Attach { pids }
            }
            AttachTarget::Node { pids, .. } if !pids.is_empty() => Target::Attach { pids: pids.clone() },
            AttachTarget::Node { name, .. } => {
                info!("recording all of node {name}");
                Target::SystemWide
            }
        };
        if let Target::Attach { pids } = &target {
            self.pids = pids.clone();
        }

        Ok(PerfCommand {
            mode: request.mode.clone(),
            target,
            duration: request.duration,
        })
    }

    fn run(&mut self, command: &PerfCommand) -> Result<RunOutput> {
        let data = self.data_path();
        run_remote_perf(self.channel()?, &self.work_dir(), command, &data)
    }

    fn collect(&mut self, command: &PerfCommand, run_dir: &Path) -> Result<CollectedTrace> {
        let data = self.data_path();
        let collected = collect_remote(self.channel()?, command, &data, run_dir)?;
        self.script.clone_from(&collected.script);
        Ok(collected)
    }

    fn read_binary(&mut self, path: &str) -> Result<Option<Vec<u8>>> {
        let channel = self.channel()?;
        // System wide sessions see paths from the host mount namespace.
        let candidates: &[Pid] = if self.pids.is_empty() { &[1] } else { &self.pids };
        match RemoteProc::new(channel).resolve_binary_path(candidates, path)? {
            Some((host_path, pid)) => {
                debug!("{path} of pid {pid} is {host_path}");
                read_remote_binary(channel, &host_path)
            }
            None => Ok(None),
        }
    }

    fn cleanup(&mut self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(channel) = self.channel.as_mut() {
            if self.work_dir_created && !self.keep {
                let dir = format!("/tmp/perfcap-{}", self.session);
                let removed = join(["rm", "-rf", dir.as_str()])
                    .and_then(|line| channel.run_checked(&line));
                if let Err(e) = removed {
                    errors.push(format!("remove {dir}: {e}"));
                }
            }
            if let Err(e) = channel.close() {
                errors.push(format!("close ssh to {}: {e}", channel.destination()));
            }
        }
        self.channel = None;

        if let Some(mut trust) = self.trust.take() {
            if let Err(e) = trust.revoke() {
                errors.push(format!("revoke ssh keys: {e}"));
            }
        }
        if let Some(mut helper) = self.helper.take() {
            if let Err(e) = helper.delete() {
                errors.push(format!("delete helper pod {}: {e}", helper.name()));
            }
        }
        if !self.keep {
            if let Some(script) = self.script.take() {
                if let Err(e) = std::fs::remove_file(&script) {
                    errors.push(format!("remove {}: {e}", script.display()));
                }
            }
        }
        errors
    }
}
