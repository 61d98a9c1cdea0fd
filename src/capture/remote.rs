//! perf on an ssh reachable host.
//!
//! Each repository gets one directory in the remote cache,
//! `<cache>/repositories/<repo>-<8 hex>`, holding a synced copy of the
//! working tree. A session owns the directory for its lifetime through a
//! `mkdir` lock next to it; a second session from the same repository
//! fails fast instead of trampling the tree. Per-session files live under
//! `<dir>/sessions/<session>`.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info, warn};

use super::local::{C2C_REPORT_FILE, SCRIPT_FILE};
use super::{Backend, CancelToken, CollectedTrace, RunOutput};
use crate::config::REMOTE_CACHE_DIR_SCRIPT;
use crate::error::{CaptureError, Result, TransportError};
use crate::perf_cmd::{self, CaptureRequest, PerfCommand, PerfMode, Target};
use crate::profile::basename;
use crate::record::{RunKind, TargetInfo};
use crate::transport::{fetch_verified, join, quote, upload_verified, Channel};
use crate::utils::{self, normalize_arch, normalize_os, short_hash};

/// `cd <dir> && perf ...` for remote execution.
pub(crate) fn perf_in_dir(dir: &str, command: &PerfCommand, data_path: &str) -> Result<(String, String)> {
    let perf = command.shell(data_path)?;
    Ok((format!("cd {} && {}", quote(dir)?, perf), perf))
}

pub(crate) fn run_remote_perf(
    channel: &dyn Channel,
    dir: &str,
    command: &PerfCommand,
    data_path: &str,
) -> Result<RunOutput> {
    let (line, perf) = perf_in_dir(dir, command, data_path)?;
    info!("running {} on {}", perf, channel.destination());
    let output = channel.run_interactive(&line)?;
    Ok(RunOutput {
        command_line: perf,
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.status,
    })
}

/// Post-process a remote `perf.data` into files under `run_dir`.
pub(crate) fn collect_remote(
    channel: &dyn Channel,
    command: &PerfCommand,
    data_path: &str,
    run_dir: &Path,
) -> Result<CollectedTrace> {
    match command.mode {
        PerfMode::Stat { .. } => Ok(CollectedTrace::default()),
        PerfMode::Record { .. } => {
            let path = run_dir.join(SCRIPT_FILE);
            let line = perf_cmd::shell_command(&perf_cmd::script_args(data_path))?;
            let mut sink = BufWriter::new(File::create(&path)?);
            let output = channel.run_streaming(&line, &mut sink)?;
            if !output.success() {
                return Err(TransportError::CommandFailed {
                    command: line,
                    status: output.status,
                    stderr: output.stderr_lossy(),
                }
                .into());
            }
            std::io::Write::flush(&mut sink)?;
            Ok(CollectedTrace {
                script: Some(path),
                c2c_report: None,
            })
        }
        PerfMode::C2c { .. } => {
            let line = perf_cmd::shell_command(&perf_cmd::c2c_report_args(data_path))?;
            let report = channel.run_checked(&line)?;
            let path = run_dir.join(C2C_REPORT_FILE);
            std::fs::write(&path, &report.stdout)?;
            Ok(CollectedTrace {
                script: None,
                c2c_report: Some(path),
            })
        }
    }
}

/// Verified contents of `path` or `None` when it is not a regular file.
pub(crate) fn read_remote_binary(channel: &dyn Channel, path: &str) -> Result<Option<Vec<u8>>> {
    let exists = channel.run(&format!("test -f {}", quote(path)?))?;
    if !exists.success() {
        return Ok(None);
    }
    fetch_verified(channel, path).map(Some)
}

/// `uname -s -m` as normalized (os, arch).
pub(crate) fn detect_system(channel: &dyn Channel) -> Result<(String, String)> {
    let output = channel.run_checked("uname -s -m")?.stdout_lossy();
    let mut fields = output.split_whitespace();
    let os = fields.next().map(normalize_os).unwrap_or_default();
    let arch = fields.next().map(normalize_arch).unwrap_or_default();
    Ok((os, arch))
}

/// `<basename>-<8 hex>` naming the repository rooted at `repo_root`.
fn repository_name(repo_root: &Path) -> String {
    let root = repo_root.to_string_lossy();
    format!("{}-{}", basename(&root), short_hash(&root, 8))
}

/// Remote directory for the repository rooted at `repo_root`.
pub fn repository_dir(cache: &str, repo_root: &Path) -> String {
    format!(
        "{}/repositories/{}",
        cache.trim_end_matches('/'),
        repository_name(repo_root)
    )
}

/// ssh control key for one session from `repo_root`; pass it to
/// [`SshOptions::control_key`](crate::transport::SshOptions::control_key)
/// before connecting.
pub fn session_control_key(repo_root: &Path, session: &str) -> String {
    format!("{}-{session}", repository_name(repo_root))
}

/// Files to mirror: tracked plus untracked files git does not ignore.
fn worktree_files(repo_root: &Path) -> Result<Vec<u8>> {
    let output = Command::new("git")
        .args(["ls-files", "-z", "--cached", "--others", "--exclude-standard"])
        .current_dir(repo_root)
        .output()
        .map_err(|source| TransportError::Spawn {
            program: "git".to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(TransportError::CommandFailed {
            command: "git ls-files".to_string(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .into());
    }
    Ok(output.stdout)
}

/// tar stream of the working tree, held in memory.
fn worktree_tar(repo_root: &Path) -> Result<Vec<u8>> {
    let files = worktree_files(repo_root)?;
    let mut cmd = Command::new("tar");
    cmd.args(["--null", "--ignore-failed-read", "-T", "-", "-cf", "-"])
        .current_dir(repo_root);
    let output = utils::run_with_input(&mut cmd, &mut files.as_slice()).map_err(|source| {
        TransportError::Spawn {
            program: "tar".to_string(),
            source,
        }
    })?;
    if output.status != Some(0) {
        return Err(TransportError::CommandFailed {
            command: "tar -cf -".to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .into());
    }
    Ok(output.stdout)
}

pub struct SshBackend<C: Channel> {
    channel: C,
    repo_root: PathBuf,
    session: String,
    keep: bool,
    info: TargetInfo,
    dir: Option<String>,
    locked: bool,
    session_dir: Option<String>,
    script: Option<PathBuf>,
}

impl<C: Channel> SshBackend<C> {
    /// `repo_root` is the local tree mirrored to the host; `session` keys
    /// this session's files inside the shared repository directory.
    pub fn new(channel: C, repo_root: impl Into<PathBuf>, session: impl Into<String>) -> Self {
        let info = TargetInfo {
            host: Some(channel.destination().to_string()),
            ..Default::default()
        };
        SshBackend {
            channel,
            repo_root: repo_root.into(),
            session: session.into(),
            keep: false,
            info,
            dir: None,
            locked: false,
            session_dir: None,
            script: None,
        }
    }

    /// Keep the session directory with the uploaded binary and perf data.
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    fn worktree(dir: &str) -> String {
        format!("{dir}/worktree")
    }

    fn lock_path(dir: &str) -> String {
        format!("{dir}.lock")
    }

    fn data_path(session_dir: &str) -> String {
        format!("{session_dir}/perf.data")
    }

    fn acquire(&mut self, dir: &str) -> Result<()> {
        let parent = dir.rsplit_once('/').map_or(dir, |(p, _)| p);
        self.channel.run_checked(&format!("mkdir -p {}", quote(parent)?))?;
        let lock = Self::lock_path(dir);
        let output = self.channel.run(&format!("mkdir {}", quote(&lock)?))?;
        if !output.success() {
            return Err(TransportError::Busy(format!(
                "{} is in use by another session (remove {} if it is stale)",
                dir, lock
            ))
            .into());
        }
        self.locked = true;
        debug!("locked {lock}");
        Ok(())
    }

    fn sync_worktree(&self, dir: &str) -> Result<()> {
        let worktree = Self::worktree(dir);
        if utils::git_toplevel(&self.repo_root).is_none() {
            warn!(
                "{} is not a git repository, not syncing a working tree",
                self.repo_root.display()
            );
            self.channel.run_checked(&format!("mkdir -p {}", quote(&worktree)?))?;
            return Ok(());
        }
        let tar = worktree_tar(&self.repo_root)?;
        info!(
            "syncing {} ({} bytes) to {}:{}",
            self.repo_root.display(),
            tar.len(),
            self.channel.destination(),
            worktree
        );
        let quoted = quote(&worktree)?;
        let command = format!("mkdir -p {quoted} && tar -C {quoted} -xf -");
        let output = self.channel.run_with_stdin(&command, &mut tar.as_slice())?;
        if !output.success() {
            return Err(TransportError::CommandFailed {
                command,
                status: output.status,
                stderr: output.stderr_lossy(),
            }
            .into());
        }
        Ok(())
    }

    fn upload_binary(&self, session_dir: &str, binary: &str) -> Result<String> {
        let remote = format!("{session_dir}/{}", basename(binary));
        info!("uploading {binary} to {}:{remote}", self.channel.destination());
        upload_verified(&self.channel, Path::new(binary), &remote)?;
        self.channel.run_checked(&format!("chmod +x {}", quote(&remote)?))?;
        Ok(remote)
    }
}

impl<C: Channel> Backend for SshBackend<C> {
    fn kind(&self) -> RunKind {
        RunKind::Ssh
    }

    fn target_info(&self) -> TargetInfo {
        self.info.clone()
    }

    fn prepare(&mut self, request: &CaptureRequest, cancel: &CancelToken) -> Result<PerfCommand> {
        let (os, arch) = detect_system(&self.channel)?;
        debug!("{} is {os}/{arch}", self.channel.destination());
        self.info.os = Some(os);
        self.info.arch = Some(arch);

        let cache = self.channel.run_checked(REMOTE_CACHE_DIR_SCRIPT)?.stdout_lossy();
        let cache = cache.trim();
        if cache.is_empty() {
            return Err(CaptureError::InvalidRequest(format!(
                "no cache directory on {}",
                self.channel.destination()
            )));
        }
        let dir = repository_dir(cache, &self.repo_root);
        self.acquire(&dir)?;
        self.dir = Some(dir.clone());
        cancel.check()?;

        self.sync_worktree(&dir)?;
        cancel.check()?;

        let session_dir = format!("{dir}/sessions/{}", self.session);
        self.channel.run_checked(&format!("mkdir -p {}", quote(&session_dir)?))?;
        self.session_dir = Some(session_dir.clone());
        let command = PerfCommand::from(request);
        match &request.target {
            Target::Launch { binary, .. } => {
                let remote = self.upload_binary(&session_dir, binary)?;
                Ok(command.with_binary(&remote))
            }
            _ => Ok(command),
        }
    }

    fn run(&mut self, command: &PerfCommand) -> Result<RunOutput> {
        let (Some(dir), Some(session_dir)) = (&self.dir, &self.session_dir) else {
            return Err(CaptureError::InvalidRequest("session was not prepared".into()));
        };
        run_remote_perf(
            &self.channel,
            &Self::worktree(dir),
            command,
            &Self::data_path(session_dir),
        )
    }

    fn collect(&mut self, command: &PerfCommand, run_dir: &Path) -> Result<CollectedTrace> {
        let Some(session_dir) = &self.session_dir else {
            return Err(CaptureError::InvalidRequest("session was not prepared".into()));
        };
        let data = Self::data_path(session_dir);
        let collected = collect_remote(&self.channel, command, &data, run_dir)?;
        self.script.clone_from(&collected.script);
        Ok(collected)
    }

    fn read_binary(&mut self, path: &str) -> Result<Option<Vec<u8>>> {
        read_remote_binary(&self.channel, path)
    }

    fn cleanup(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut note = |what: String, result: Result<()>| {
            if let Err(e) = result {
                errors.push(format!("{what}: {e}"));
            }
        };

        if !self.keep {
            if let Some(session_dir) = self.session_dir.take() {
                let result = join(["rm", "-rf", session_dir.as_str()])
                    .and_then(|line| self.channel.run_checked(&line))
                    .map(|_| ())
                    .map_err(CaptureError::from);
                note(format!("remove {session_dir}"), result);
            }
            if let Some(script) = self.script.take() {
                let result = std::fs::remove_file(&script).map_err(CaptureError::from);
                note(format!("remove {}", script.display()), result);
            }
        }

        if std::mem::take(&mut self.locked) {
            if let Some(dir) = &self.dir {
                let lock = Self::lock_path(dir);
                let result = join(["rmdir", lock.as_str()])
                    .and_then(|line| self.channel.run_checked(&line))
                    .map(|_| ())
                    .map_err(CaptureError::from);
                note(format!("release {lock}"), result);
            }
        }

        note(
            format!("close {}", self.channel.destination()),
            self.channel.close().map_err(CaptureError::from),
        );
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{run_capture, CaptureOptions};
    use crate::transport::fake::{failed, ok, FakeChannel};
    use crate::transport::ssh::control_path;
    use crate::transport::SshOptions;
    use crate::utils::sha256_hex;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use tempfile::TempDir;

    const SCRIPT: &str = "app 9 1.0: 5 cycles:\n\t401000 main+0x4 (/opt/lib/libhot.so)\n\n";

    fn base_channel() -> FakeChannel {
        FakeChannel::default()
            .respond("uname -s -m", ok("Linux aarch64\n"))
            .respond("XDG_CACHE_HOME", ok("/home/me/.cache/perfcap\n"))
    }

    #[test]
    fn test_repository_dir() {
        let dir = repository_dir("/home/me/.cache/perfcap/", Path::new("/src/widget"));
        let prefix = "/home/me/.cache/perfcap/repositories/widget-";
        assert!(dir.starts_with(prefix), "{dir}");
        assert_eq!(dir.len(), prefix.len() + 8);
        assert_eq!(dir, repository_dir("/home/me/.cache/perfcap", Path::new("/src/widget")));
    }

    #[test]
    fn test_concurrent_sessions_stay_apart() {
        let cache = "/home/me/.cache/perfcap";
        let widget = Path::new("/src/widget");
        let gadget = Path::new("/src/gadget");
        let a = repository_dir(cache, widget);
        let b = repository_dir(cache, gadget);
        assert_ne!(a, b);
        assert!(a.ends_with(&format!("widget-{}", short_hash("/src/widget", 8))), "{a}");
        // Same basename in another checkout still gets its own directory.
        assert_ne!(a, repository_dir(cache, Path::new("/work/widget")));

        let control_dir = Path::new("/run/user/1000/perfcap");
        let socket = |root: &Path, session: &str| {
            let options = SshOptions::new(control_dir).control_key(session_control_key(root, session));
            control_path(control_dir, "me@box", options.control_key.as_deref())
        };
        assert_ne!(socket(widget, "s1"), socket(gadget, "s2"));
        assert_ne!(socket(widget, "s1"), socket(widget, "s2"));
        assert_eq!(socket(widget, "s1"), socket(widget, "s1"));
    }

    #[test]
    fn test_detect_system() {
        let channel = base_channel();
        assert_eq!(
            detect_system(&channel).unwrap(),
            ("linux".to_string(), "arm64".to_string())
        );
    }

    #[test]
    fn test_busy_lock_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let channel = base_channel().respond(".lock", failed(1, "mkdir: File exists\n"));
        let mut backend = SshBackend::new(channel, tmp.path(), "s1");
        let request = CaptureRequest::new(
            PerfMode::Record {
                event: None,
                count: None,
            },
            Target::SystemWide,
        );
        let err = run_capture(&mut backend, &request, tmp.path(), &CaptureOptions::default()).unwrap_err();
        assert!(matches!(err, CaptureError::Transport(TransportError::Busy(_))));
        // The lock was never ours, so it is not removed.
        assert!(!backend.channel.commands().iter().any(|c| c.starts_with("rmdir")));
    }

    #[test]
    fn test_attach_session() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("not-a-repo");
        std::fs::create_dir(&repo).unwrap();
        let run_dir = tmp.path().join("run");
        std::fs::create_dir(&run_dir).unwrap();

        let lib = b"\x7fELF shared object";
        let channel = base_channel()
            .respond("&& perf record", ok("recorded\n"))
            .respond("perf script", ok(SCRIPT))
            .respond("sha256sum", ok(&format!("{}  /opt/lib/libhot.so\n", sha256_hex(lib))))
            .respond("base64 <", ok(&STANDARD.encode(lib)));
        let mut backend = SshBackend::new(channel, &repo, "s1");
        let request = CaptureRequest::new(
            PerfMode::Record {
                event: None,
                count: None,
            },
            Target::Attach { pids: vec![9] },
        );
        let capture = run_capture(&mut backend, &request, &run_dir, &CaptureOptions::default()).unwrap();

        assert_eq!(capture.stdout, b"recorded\n");
        assert_eq!(capture.target_info.os.as_deref(), Some("linux"));
        assert_eq!(capture.target_info.host.as_deref(), Some("fake@host"));
        assert_eq!(capture.artifacts.len(), 1);
        assert_eq!(capture.artifacts[0].basename, "libhot.so");
        let profile = capture.profile.unwrap();
        assert_eq!(
            profile.binary_paths(),
            [capture.artifacts[0].path.to_string_lossy().as_ref()]
        );

        let commands = backend.channel.commands();
        let run = commands.iter().find(|c| c.contains("perf record")).unwrap();
        let argv = shlex::split(run).unwrap();
        assert_eq!(argv[0], "cd");
        assert!(argv[1].starts_with("/home/me/.cache/perfcap/repositories/not-a-repo-"));
        assert!(argv[1].ends_with("/worktree"));
        assert_eq!(argv[2..7], ["&&", "perf", "record", "-g", "--call-graph"]);
        assert!(argv.iter().any(|a| a.ends_with("/sessions/s1/perf.data")));
        assert_eq!(argv[argv.len() - 4..], ["-p", "9", "sleep", "10"]);
        assert!(commands
            .iter()
            .any(|c| c.starts_with("rm -rf ") && c.contains("/sessions/s1")));
        assert!(commands.iter().any(|c| c.starts_with("rmdir ") && c.contains(".lock")));
        assert!(!run_dir.join(SCRIPT_FILE).exists());
    }

    #[test]
    fn test_launch_uploads_binary() {
        let tmp = TempDir::new().unwrap();
        let bin = tmp.path().join("bench");
        std::fs::write(&bin, b"binary").unwrap();
        let channel = base_channel().respond(
            "sha256sum",
            ok(&format!("{}  x\n", sha256_hex(b"binary"))),
        );
        let mut backend = SshBackend::new(channel, tmp.path(), "s2");
        let request = CaptureRequest::new(
            PerfMode::Stat {
                events: vec![],
                detail: false,
            },
            Target::Launch {
                binary: bin.to_string_lossy().into_owned(),
                args: vec!["-n".into()],
            },
        );
        let command = backend.prepare(&request, &CancelToken::new()).unwrap();
        let Target::Launch { binary, .. } = &command.target else {
            panic!("launch target expected");
        };
        assert!(binary.ends_with("/sessions/s2/bench"));
        assert_eq!(
            backend.channel.uploads.borrow().get(binary.as_str()).map(Vec::as_slice),
            Some(b"binary".as_slice())
        );
        assert!(backend.channel.commands().iter().any(|c| c.starts_with("chmod +x")));
    }
}
