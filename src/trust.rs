//! Single-use ssh credentials for a helper pod.
//!
//! The helper generates a fresh host key and user key, we copy the private
//! user key and the host public key out once, and the session pins exactly
//! that host key in a one line `known_hosts`. Everything is removed again
//! when the [`EphemeralTrust`] goes away.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use tempfile::TempDir;

use crate::error::{CaptureError, KubeError};
use crate::kube::PodLifecycle;
use crate::transport::SshOptions;

const HOST_KEY: &str = "/etc/ssh/ssh_host_ed25519_key";
const USER_KEY: &str = "/root/.ssh/id_ed25519";
const AUTHORIZED_KEYS: &str = "/root/.ssh/authorized_keys";

pub struct EphemeralTrust<P: PodLifecycle> {
    pods: Arc<P>,
    pod: String,
    dir: Option<TempDir>,
    identity_file: PathBuf,
    known_hosts_file: PathBuf,
    revoked: bool,
}

fn write_private(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)?;
    file.write_all(contents)
}

impl<P: PodLifecycle> EphemeralTrust<P> {
    /// Generate keys inside `pod` and export them to a private temp dir.
    pub fn provision(pods: Arc<P>, pod: &str) -> Result<Self, CaptureError> {
        info!("provisioning ephemeral ssh keys in {pod}");
        let dir = tempfile::Builder::new().prefix("perfcap-ssh-").tempdir()?;
        let identity_file = dir.path().join("id_ed25519");
        let known_hosts_file = dir.path().join("known_hosts");

        // From here on Drop revokes whatever was created in the pod.
        let trust = EphemeralTrust {
            pods,
            pod: pod.to_string(),
            dir: Some(dir),
            identity_file,
            known_hosts_file,
            revoked: false,
        };

        let host_pub = format!("{HOST_KEY}.pub");
        let user_pub = format!("{USER_KEY}.pub");
        let steps: [&[&str]; 5] = [
            &["mkdir", "-p", "/etc/ssh", "/root/.ssh"],
            &["chmod", "700", "/root/.ssh"],
            &["rm", "-f", HOST_KEY, host_pub.as_str(), USER_KEY, user_pub.as_str()],
            &["ssh-keygen", "-q", "-t", "ed25519", "-f", HOST_KEY, "-N", ""],
            &["ssh-keygen", "-q", "-t", "ed25519", "-f", USER_KEY, "-N", ""],
        ];
        for argv in steps {
            debug!("[{pod}] {}", argv.join(" "));
            trust.pods.exec(pod, argv)?;
        }
        let authorize = format!("cat {user_pub} > {AUTHORIZED_KEYS} && chmod 600 {AUTHORIZED_KEYS}");
        trust.pods.exec(pod, &["sh", "-c", authorize.as_str()])?;

        let private_key = trust.pods.exec(pod, &["cat", USER_KEY])?.stdout;
        let host_key = trust.pods.exec(pod, &["cat", host_pub.as_str()])?.stdout_lossy();
        let host_key = host_key.trim();
        if private_key.is_empty() || host_key.is_empty() {
            return Err(KubeError::HelperFailed {
                name: pod.to_string(),
                phase: "generated empty ssh keys".to_string(),
            }
            .into());
        }

        write_private(&trust.identity_file, &private_key, 0o600)?;
        write_private(
            &trust.known_hosts_file,
            format!("{pod} {host_key}\n").as_bytes(),
            0o644,
        )?;
        debug!("ssh keys for {pod} stored in {}", trust.identity_file.display());
        Ok(trust)
    }

    /// ssh destination for the helper.
    pub fn destination(&self) -> String {
        format!("root@{}", self.pod)
    }

    pub fn identity_file(&self) -> &Path {
        &self.identity_file
    }

    pub fn known_hosts_file(&self) -> &Path {
        &self.known_hosts_file
    }

    /// Options tunnelling ssh through `kubectl exec` with only these keys.
    pub fn ssh_options(&self, control_dir: PathBuf) -> SshOptions {
        SshOptions::new(control_dir)
            .identity_file(&self.identity_file)
            .known_hosts_file(&self.known_hosts_file)
            .proxy_command(self.pods.ssh_proxy_command(&self.pod))
            .extra_option("IdentitiesOnly=yes")
    }

    /// Delete the keys in the pod and the local copies.
    pub fn revoke(&mut self) -> Result<(), CaptureError> {
        if std::mem::replace(&mut self.revoked, true) {
            return Ok(());
        }
        debug!("revoking ephemeral ssh keys for {}", self.pod);
        let host_pub = format!("{HOST_KEY}.pub");
        let user_pub = format!("{USER_KEY}.pub");
        let remote = self.pods.exec(
            &self.pod,
            &[
                "rm",
                "-f",
                HOST_KEY,
                host_pub.as_str(),
                USER_KEY,
                user_pub.as_str(),
                AUTHORIZED_KEYS,
            ],
        );
        let local = match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        };
        remote?;
        local?;
        Ok(())
    }
}

impl<P: PodLifecycle> Drop for EphemeralTrust<P> {
    fn drop(&mut self) {
        if let Err(e) = self.revoke() {
            warn!("failed to revoke ssh keys for {}: {}", self.pod, e);
            // The local copy must not outlive the session.
            if self.identity_file.exists() {
                let _ = fs::remove_file(&self.identity_file);
            }
        }
    }
}
