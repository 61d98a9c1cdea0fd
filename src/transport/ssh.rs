//! OpenSSH transport with ControlMaster multiplexing.
//!
//! `connect` starts a background master (`ssh -f -N`) bound to a control
//! socket; every later command and `scp` reuses that socket instead of
//! authenticating again. Sockets live under `<runtime dir>/perfcap` and are
//! named after a short hash of the destination and the session key, so
//! concurrent sessions against one host never share a master, and the path
//! stays below the unix socket length limit.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, warn};

use crate::error::TransportError;
use crate::transport::{Channel, CommandOutput};
use crate::utils::{self, short_hash};

const SSH: &str = "ssh";
const SCP: &str = "scp";

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub identity_file: Option<PathBuf>,
    pub known_hosts_file: Option<PathBuf>,
    pub proxy_command: Option<String>,
    /// Extra `-o` options, e.g. `StrictHostKeyChecking=no`.
    pub extra_options: Vec<String>,
    /// How long the master lingers after the last client disconnects.
    pub control_persist: String,
    /// Directory that holds the control socket.
    pub control_dir: PathBuf,
    /// Separates the masters of concurrent sessions to one destination.
    pub control_key: Option<String>,
    /// Mirror the output of interactive commands to the local terminal.
    pub echo: bool,
}

impl SshOptions {
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        SshOptions {
            identity_file: None,
            known_hosts_file: None,
            proxy_command: None,
            extra_options: Vec::new(),
            control_persist: "30s".to_string(),
            control_dir: control_dir.into(),
            control_key: None,
            echo: true,
        }
    }

    pub fn identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn known_hosts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_file = Some(path.into());
        self
    }

    pub fn proxy_command(mut self, command: impl Into<String>) -> Self {
        self.proxy_command = Some(command.into());
        self
    }

    pub fn extra_option(mut self, option: impl Into<String>) -> Self {
        self.extra_options.push(option.into());
        self
    }

    pub fn control_key(mut self, key: impl Into<String>) -> Self {
        self.control_key = Some(key.into());
        self
    }

    /// Authentication and host verification arguments shared by the master
    /// and every client invocation.
    fn auth_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        if let Some(known_hosts) = &self.known_hosts_file {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        if let Some(proxy) = &self.proxy_command {
            args.push("-o".to_string());
            args.push(format!("ProxyCommand={proxy}"));
        }
        for option in &self.extra_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }
}

/// Control socket path for `destination` inside `control_dir`, distinct
/// per `key`.
pub fn control_path(control_dir: &Path, destination: &str, key: Option<&str>) -> PathBuf {
    let identity = match key {
        Some(key) => format!("{destination}\0{key}"),
        None => destination.to_string(),
    };
    control_dir.join(format!("ssh-{}", short_hash(&identity, 12)))
}

fn master_args(destination: &str, control_path: &Path, options: &SshOptions) -> Vec<String> {
    let mut args: Vec<String> = [
        "-o".to_string(),
        "ControlMaster=auto".to_string(),
        "-o".to_string(),
        format!("ControlPath={}", control_path.display()),
        "-o".to_string(),
        format!("ControlPersist={}", options.control_persist),
        "-o".to_string(),
        "ConnectTimeout=10".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=15".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=3".to_string(),
    ]
    .into();
    args.extend(options.auth_args());
    args.extend(["-f".to_string(), "-N".to_string(), destination.to_string()]);
    args
}

fn client_args(control_path: &Path, options: &SshOptions) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        format!("ControlPath={}", control_path.display()),
        "-o".to_string(),
        "ControlMaster=no".to_string(),
    ];
    args.extend(options.auth_args());
    args
}

#[derive(Debug)]
pub struct SshChannel {
    destination: String,
    control_path: PathBuf,
    options: SshOptions,
    closed: bool,
}

impl SshChannel {
    /// Start the master connection for `destination`.
    pub fn connect(destination: &str, options: SshOptions) -> Result<Self, TransportError> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&options.control_dir)?;
        let control_path = control_path(
            &options.control_dir,
            destination,
            options.control_key.as_deref(),
        );
        debug!(
            "starting ssh master for {} at {} ({} bytes)",
            destination,
            control_path.display(),
            control_path.as_os_str().len()
        );

        let output = Command::new(SSH)
            .args(master_args(destination, &control_path, &options))
            .stdin(Stdio::null())
            .output()
            .map_err(|source| TransportError::Spawn {
                program: SSH.to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(TransportError::Connect {
                destination: destination.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        debug!("ssh master for {destination} established");

        Ok(SshChannel {
            destination: destination.to_string(),
            control_path,
            options,
            closed: false,
        })
    }

    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    fn command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new(SSH);
        cmd.args(client_args(&self.control_path, &self.options))
            .arg(&self.destination)
            .arg(remote_command);
        cmd
    }

    fn spawn_error(source: std::io::Error) -> TransportError {
        TransportError::Spawn {
            program: SSH.to_string(),
            source,
        }
    }
}

impl Channel for SshChannel {
    fn destination(&self) -> &str {
        &self.destination
    }

    fn run(&self, command: &str) -> Result<CommandOutput, TransportError> {
        debug!("[{}] {}", self.destination, command);
        let output = self
            .command(command)
            .stdin(Stdio::null())
            .output()
            .map_err(Self::spawn_error)?;
        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            status: output.status.code(),
        })
    }

    fn run_interactive(&self, command: &str) -> Result<CommandOutput, TransportError> {
        if !self.options.echo {
            return self.run(command);
        }
        debug!("[{}] {} (interactive)", self.destination, command);
        utils::run_teed(&mut self.command(command)).map_err(Self::spawn_error)
    }

    fn run_streaming(&self, command: &str, sink: &mut dyn Write) -> Result<CommandOutput, TransportError> {
        debug!("[{}] {} (streaming)", self.destination, command);
        utils::run_into(&mut self.command(command), sink).map_err(Self::spawn_error)
    }

    fn run_with_stdin(&self, command: &str, input: &mut dyn Read) -> Result<CommandOutput, TransportError> {
        debug!("[{}] {} (stdin)", self.destination, command);
        utils::run_with_input(&mut self.command(command), input).map_err(Self::spawn_error)
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        debug!("scp {} {}:{}", local.display(), self.destination, remote);
        let output = Command::new(SCP)
            .args(client_args(&self.control_path, &self.options))
            .arg(local)
            .arg(format!("{}:{}", self.destination, remote))
            .stdin(Stdio::null())
            .output()
            .map_err(|source| TransportError::Spawn {
                program: SCP.to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                command: format!("scp {} {remote}", local.display()),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    /// Stop the master and remove its socket.
    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("closing ssh master {}", self.control_path.display());

        let output = Command::new(SSH)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .output()
            .map_err(Self::spawn_error)?;
        let removed = match fs::remove_file(&self.control_path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                command: "ssh -O exit".to_string(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        removed?;
        Ok(())
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close ssh connection to {}: {}", self.destination, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SshOptions {
        SshOptions::new("/run/user/1000/perfcap")
    }

    #[test]
    fn test_control_path_is_short_and_stable() {
        let dir = Path::new("/run/user/1000/perfcap");
        let a = control_path(dir, "someone@a-very-long-hostname.example.com", None);
        assert_eq!(a, control_path(dir, "someone@a-very-long-hostname.example.com", None));
        let name = a.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), "ssh-".len() + 12);
        assert_ne!(a, control_path(dir, "someone@b", None));
    }

    #[test]
    fn test_sessions_to_one_host_get_their_own_socket() {
        let dir = Path::new("/run/x");
        let first = control_path(dir, "me@box", Some("widget-1a2b3c4d-s1"));
        let second = control_path(dir, "me@box", Some("gadget-5e6f7a8b-s2"));
        assert_ne!(first, second);
        assert_eq!(first, control_path(dir, "me@box", Some("widget-1a2b3c4d-s1")));
        assert_ne!(first, control_path(dir, "me@box", None));
        assert_eq!(
            options().control_key("k").control_key.as_deref(),
            Some("k")
        );
    }

    #[test]
    fn test_master_args() {
        let path = Path::new("/tmp/ctl");
        let args = master_args("me@host", path, &options());
        for expected in [
            "ControlMaster=auto",
            "ControlPath=/tmp/ctl",
            "ControlPersist=30s",
            "ConnectTimeout=10",
            "ServerAliveInterval=15",
            "ServerAliveCountMax=3",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
        assert_eq!(&args[args.len() - 3..], ["-f", "-N", "me@host"]);
    }

    #[test]
    fn test_client_args_carry_auth_options() {
        let opts = options()
            .identity_file("/keys/id_ed25519")
            .known_hosts_file("/keys/known_hosts")
            .proxy_command("kubectl exec -i pod -- sshd -i")
            .extra_option("IdentitiesOnly=yes");
        let args = client_args(Path::new("/tmp/ctl"), &opts);
        assert_eq!(
            args,
            [
                "-o",
                "ControlPath=/tmp/ctl",
                "-o",
                "ControlMaster=no",
                "-i",
                "/keys/id_ed25519",
                "-o",
                "UserKnownHostsFile=/keys/known_hosts",
                "-o",
                "ProxyCommand=kubectl exec -i pod -- sshd -i",
                "-o",
                "IdentitiesOnly=yes",
            ]
        );
    }
}
