use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::profile::MappingBounds;

/// Name of the per-user directories this tool creates.
pub const APP_DIR: &str = "perfcap";

/// Configuration for capture sessions, independent of the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    pub verbosity: u8,
    /// Image for the privileged helper pod; it needs perf, sshd and bash
    pub helper_image: Option<String>,
    /// kubectl context (None = current context)
    pub kube_context: Option<String>,
    /// Namespace of the target pod and the helper pod
    pub namespace: String,
    /// Upper bound on waiting for the helper pod to become ready
    pub ready_timeout: Duration,
    /// Interval between helper pod readiness checks
    pub poll_interval: Duration,
    /// ControlPersist value for ssh masters
    pub control_persist: String,
    /// Keep remote directories, helper pods and raw perf files
    pub keep: bool,
    /// How mapping address bounds are written into profiles
    pub mapping_bounds: MappingBounds,
    /// Override for the control socket directory
    pub control_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            helper_image: None,
            kube_context: None,
            namespace: "default".to_string(),
            ready_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            control_persist: "30s".to_string(),
            keep: false,
            mapping_bounds: MappingBounds::FullRange,
            control_dir: None,
        }
    }
}

impl Config {
    /// Directory for ssh control sockets. Kept short because unix socket
    /// paths are limited to roughly 108 bytes.
    pub fn control_dir(&self) -> PathBuf {
        if let Some(dir) = &self.control_dir {
            return dir.clone();
        }
        runtime_dir(
            env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from),
            env::var_os("XDG_CONFIG_HOME").map(PathBuf::from),
            env::var_os("HOME").map(PathBuf::from),
            &env::temp_dir(),
        )
    }
}

fn non_empty(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

/// `$XDG_RUNTIME_DIR/perfcap`, then `$XDG_CONFIG_HOME/perfcap` or
/// `~/.config/perfcap`, then the temp dir.
pub fn runtime_dir(
    xdg_runtime: Option<PathBuf>,
    xdg_config: Option<PathBuf>,
    home: Option<PathBuf>,
    temp: &Path,
) -> PathBuf {
    if let Some(dir) = non_empty(xdg_runtime) {
        return dir.join(APP_DIR);
    }
    if let Some(dir) = non_empty(xdg_config).or_else(|| non_empty(home).map(|h| h.join(".config"))) {
        return dir.join(APP_DIR);
    }
    temp.join(APP_DIR)
}

/// Shell snippet printing the cache directory on a remote host.
pub const REMOTE_CACHE_DIR_SCRIPT: &str = r#"if [ -n "$XDG_CACHE_HOME" ]; then echo "$XDG_CACHE_HOME/perfcap"; elif [ -n "$HOME" ]; then echo "$HOME/.cache/perfcap"; else echo /tmp/perfcap; fi"#;
