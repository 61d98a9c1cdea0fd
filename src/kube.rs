//! Helper pod lifecycle through `kubectl`.
//!
//! The helper is a privileged pod in the host PID namespace scheduled on the
//! target pod's node. It runs `sleep infinity` and is reached with
//! `kubectl exec`, including as the proxy command of an ssh session.

use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;

use crate::capture::CancelToken;
use crate::error::{CaptureError, KubeError, TransportError};
use crate::resolve::normalize_container_id;
use crate::transport::{join, CommandOutput};

const KUBECTL: &str = "kubectl";

/// Kubernetes names are DNS labels.
const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodSpec {
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodStatus {
    pub phase: String,
    pub container_statuses: Vec<ContainerStatus>,
    pub init_container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    pub ready: bool,
    #[serde(rename = "containerID")]
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Node {
    pub metadata: ObjectMeta,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_info: NodeInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeInfo {
    pub operating_system: String,
    pub architecture: String,
}

impl Pod {
    /// `(container name, id)` for init and regular containers, runtime
    /// prefix stripped. Containers that haven't started have no id.
    pub fn container_ids(&self) -> Vec<(String, String)> {
        self.status
            .init_container_statuses
            .iter()
            .chain(&self.status.container_statuses)
            .filter_map(|status| {
                let id = normalize_container_id(status.container_id.as_deref()?);
                (!id.is_empty()).then(|| (status.name.clone(), id.to_string()))
            })
            .collect()
    }

    pub fn is_ready(&self) -> bool {
        self.status.phase == "Running" && self.status.container_statuses.iter().all(|s| s.ready)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperPodSpec {
    pub name: String,
    pub image: String,
    pub node_name: String,
}

impl HelperPodSpec {
    /// `kubectl run --overrides` document for the privileged helper.
    pub fn overrides(&self) -> serde_json::Value {
        json!({
            "metadata": {
                "labels": {
                    "app.kubernetes.io/name": "perfcap",
                    "app.kubernetes.io/component": "perf-profiler",
                    "app.kubernetes.io/managed-by": "perfcap",
                }
            },
            "spec": {
                "hostPID": true,
                "nodeName": self.node_name,
                "containers": [{
                    "name": self.name,
                    "image": self.image,
                    "command": ["sleep", "infinity"],
                    "securityContext": { "privileged": true },
                }]
            }
        })
    }
}

/// `perfcap-<target>-<suffix>`, cut down to a valid DNS label.
pub fn helper_pod_name(target: &str, suffix: &str) -> String {
    let mut name = format!("perfcap-{target}-");
    let budget = MAX_NAME_LEN.saturating_sub(suffix.len());
    if name.len() > budget {
        name.truncate(budget);
        while name.ends_with('-') {
            name.pop();
        }
        name.push('-');
    }
    name.push_str(suffix);
    name
}

pub fn random_suffix() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// The pod operations capture sessions need.
pub trait PodLifecycle {
    fn namespace(&self) -> &str;

    fn get_pod(&self, name: &str) -> Result<Pod, KubeError>;

    fn get_node(&self, name: &str) -> Result<Node, KubeError>;

    fn create_privileged_pod(&self, spec: &HelperPodSpec) -> Result<(), KubeError>;

    /// Run `argv` in `pod`; a non-zero exit is an error.
    fn exec(&self, pod: &str, argv: &[&str]) -> Result<CommandOutput, KubeError>;

    fn delete_pod(&self, name: &str) -> Result<(), KubeError>;

    /// Shell command that speaks the ssh protocol on stdin/stdout by running
    /// `sshd -i` inside `pod`.
    fn ssh_proxy_command(&self, pod: &str) -> String;
}

/// Poll until `name` is running with every container ready.
pub fn await_ready<P: PodLifecycle + ?Sized>(
    pods: &P,
    name: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancelToken,
) -> Result<Pod, CaptureError> {
    let deadline = Instant::now() + timeout;
    loop {
        cancel.check()?;
        match pods.get_pod(name) {
            Ok(pod) if pod.is_ready() => {
                debug!("pod {name} is ready");
                return Ok(pod);
            }
            Ok(pod) if matches!(pod.status.phase.as_str(), "Failed" | "Succeeded") => {
                return Err(KubeError::HelperFailed {
                    name: name.to_string(),
                    phase: pod.status.phase,
                }
                .into());
            }
            Ok(pod) => debug!("pod {name} is {}", pod.status.phase),
            // Not visible yet right after creation.
            Err(e) => debug!("pod {name} not available yet: {e}"),
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(CaptureError::Timeout(timeout, format!("pod {name} to become ready")));
        }
        thread::sleep(interval.min(deadline - now));
    }
}

/// A created helper pod, deleted on drop unless kept.
pub struct HelperPod<P: PodLifecycle> {
    pods: Arc<P>,
    name: String,
    keep: bool,
    deleted: bool,
}

impl<P: PodLifecycle> HelperPod<P> {
    pub fn create(pods: Arc<P>, spec: &HelperPodSpec, keep: bool) -> Result<Self, KubeError> {
        info!(
            "creating helper pod {} on node {} with image {}",
            spec.name, spec.node_name, spec.image
        );
        pods.create_privileged_pod(spec)?;
        Ok(HelperPod {
            pods,
            name: spec.name.clone(),
            keep,
            deleted: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delete(&mut self) -> Result<(), KubeError> {
        if std::mem::replace(&mut self.deleted, true) {
            return Ok(());
        }
        if self.keep {
            info!("keeping helper pod {}", self.name);
            return Ok(());
        }
        info!("deleting helper pod {}", self.name);
        self.pods.delete_pod(&self.name)
    }
}

impl<P: PodLifecycle> Drop for HelperPod<P> {
    fn drop(&mut self) {
        if let Err(e) = self.delete() {
            warn!("failed to delete helper pod {}: {}", self.name, e);
        }
    }
}

/// [`PodLifecycle`] backed by the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct Kubectl {
    context: Option<String>,
    namespace: String,
}

impl Kubectl {
    pub fn new(context: Option<String>, namespace: impl Into<String>) -> Self {
        Kubectl {
            context,
            namespace: namespace.into(),
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(context) = &self.context {
            args.extend(["--context".to_string(), context.clone()]);
        }
        args.extend(["-n".to_string(), self.namespace.clone()]);
        args
    }

    fn run(&self, args: &[String]) -> Result<CommandOutput, TransportError> {
        let mut full = self.base_args();
        full.extend(args.iter().cloned());
        debug!("{} {}", KUBECTL, full.join(" "));
        let output = Command::new(KUBECTL)
            .args(&full)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| TransportError::Spawn {
                program: KUBECTL.to_string(),
                source,
            })?;
        let output = CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            status: output.status.code(),
        };
        if !output.success() {
            return Err(TransportError::CommandFailed {
                command: format!("{KUBECTL} {}", args.join(" ")),
                status: output.status,
                stderr: output.stderr_lossy(),
            });
        }
        Ok(output)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, kind: &str, name: &str) -> Result<T, KubeError> {
        let args = ["get", kind, name, "-o", "json"].map(String::from);
        match self.run(&args) {
            Ok(output) => Ok(serde_json::from_slice(&output.stdout)?),
            Err(TransportError::CommandFailed { stderr, .. }) if stderr.contains("NotFound") => {
                Err(KubeError::NotFound {
                    kind: kind.to_string(),
                    name: format!("{}/{}", self.namespace, name),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl PodLifecycle for Kubectl {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn get_pod(&self, name: &str) -> Result<Pod, KubeError> {
        self.get_json("pod", name)
    }

    fn get_node(&self, name: &str) -> Result<Node, KubeError> {
        self.get_json("node", name)
    }

    fn create_privileged_pod(&self, spec: &HelperPodSpec) -> Result<(), KubeError> {
        let args = [
            "run".to_string(),
            spec.name.clone(),
            format!("--image={}", spec.image),
            "--restart=Never".to_string(),
            format!("--overrides={}", spec.overrides()),
        ];
        self.run(&args)?;
        Ok(())
    }

    fn exec(&self, pod: &str, argv: &[&str]) -> Result<CommandOutput, KubeError> {
        let mut args = vec!["exec".to_string(), "-i".to_string(), pod.to_string(), "--".to_string()];
        args.extend(argv.iter().map(|a| a.to_string()));
        Ok(self.run(&args)?)
    }

    fn delete_pod(&self, name: &str) -> Result<(), KubeError> {
        let args = ["delete", "pod", name, "--grace-period=0", "--force"].map(String::from);
        self.run(&args)?;
        Ok(())
    }

    fn ssh_proxy_command(&self, pod: &str) -> String {
        let mut args = vec![KUBECTL.to_string(), "exec".to_string(), "-i".to_string()];
        args.extend(self.base_args());
        args.extend([
            pod.to_string(),
            "--".to_string(),
            "bash".to_string(),
            "-c".to_string(),
            "/usr/sbin/sshd -i 2> /dev/null".to_string(),
        ]);
        // Names and contexts are plain identifiers; fall back to naive joining
        // if one somehow carries a NUL.
        join(args.iter().map(String::as_str)).unwrap_or_else(|_| args.join(" "))
    }
}
