//! Capture sessions.
//!
//! A [`Backend`] knows how to run perf in one environment. [`run_capture`]
//! drives any backend through the same session states:
//!
//! ```text
//! Idle -> Prepared -> Running -> Collected -> Parsed -> Archived -> Cleaned
//! ```
//!
//! The target exiting non-zero is recorded, not raised. Failures after the
//! target ran leave a capture without a profile. Cleanup runs on every path
//! and only ever logs.

pub mod attach;
pub mod local;
pub mod remote;

pub use attach::{AttachBackend, AttachTarget};
pub use local::LocalBackend;
pub use remote::{session_control_key, SshBackend};

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::artifact::{self, Artifact, ArtifactStore};
use crate::error::{CaptureError, Result};
use crate::perf_cmd::{CaptureRequest, PerfCommand, Target};
use crate::perf_script::{self, ParseOptions};
use crate::pprof;
use crate::profile::{basename, MappingBounds, Profile};
use crate::record::{RunKind, TargetInfo};

/// Shared flag flipped by the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Prepared,
    Running,
    Collected,
    Parsed,
    Archived,
    Cleaned,
}

/// Raw result of running perf.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub command_line: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

/// Post-processed perf output written into the run directory.
#[derive(Debug, Clone, Default)]
pub struct CollectedTrace {
    /// `perf script` text of a record session.
    pub script: Option<PathBuf>,
    /// `perf c2c report --stdio` of a c2c session.
    pub c2c_report: Option<PathBuf>,
}

pub trait Backend {
    fn kind(&self) -> RunKind;

    /// Where the session runs; complete once `prepare` returned.
    fn target_info(&self) -> TargetInfo;

    /// Set up the environment and return the perf command to run.
    fn prepare(&mut self, request: &CaptureRequest, cancel: &CancelToken) -> Result<PerfCommand>;

    fn run(&mut self, command: &PerfCommand) -> Result<RunOutput>;

    fn collect(&mut self, command: &PerfCommand, run_dir: &Path) -> Result<CollectedTrace>;

    /// Contents of a binary named in the profile, `None` if it is gone.
    fn read_binary(&mut self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Release everything `prepare` created. Returns the errors it hit.
    fn cleanup(&mut self) -> Vec<String>;
}

#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    pub mapping_bounds: MappingBounds,
    pub cancel: CancelToken,
}

/// Everything a finished session produced.
#[derive(Debug, Clone)]
pub struct Capture {
    pub kind: RunKind,
    pub command: PerfCommand,
    pub command_line: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub profile: Option<Profile>,
    pub profile_path: Option<PathBuf>,
    pub artifacts: Vec<Artifact>,
    pub report: Option<PathBuf>,
    pub post_processing_error: Option<String>,
    pub state_history: Vec<SessionState>,
    pub cleanup_errors: Vec<String>,
    pub target_info: TargetInfo,
}

impl Capture {
    pub fn new(kind: RunKind, command: PerfCommand) -> Self {
        Capture {
            kind,
            command,
            command_line: String::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            elapsed: Duration::ZERO,
            profile: None,
            profile_path: None,
            artifacts: Vec::new(),
            report: None,
            post_processing_error: None,
            state_history: vec![SessionState::Idle],
            cleanup_errors: Vec::new(),
            target_info: TargetInfo::default(),
        }
    }

    pub fn target_succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn enter(&mut self, state: SessionState) {
        let from = self.state_history.last().copied().unwrap_or(SessionState::Idle);
        info!("capture session: {:?} -> {:?}", from, state);
        self.state_history.push(state);
    }
}

/// Run one capture session with `backend`, writing its files to `run_dir`.
pub fn run_capture<B: Backend + ?Sized>(
    backend: &mut B,
    request: &CaptureRequest,
    run_dir: &Path,
    options: &CaptureOptions,
) -> Result<Capture> {
    request.validate()?;
    let result = drive(backend, request, run_dir, options);

    let cleanup_errors = backend.cleanup();
    for e in &cleanup_errors {
        warn!("cleanup: {e}");
    }

    let mut capture = result?;
    capture.cleanup_errors = cleanup_errors;
    capture.enter(SessionState::Cleaned);
    Ok(capture)
}

fn drive<B: Backend + ?Sized>(
    backend: &mut B,
    request: &CaptureRequest,
    run_dir: &Path,
    options: &CaptureOptions,
) -> Result<Capture> {
    let cancel = &options.cancel;
    cancel.check()?;

    let command = backend.prepare(request, cancel)?;
    command.validate()?;
    let mut capture = Capture::new(backend.kind(), command);
    capture.enter(SessionState::Prepared);
    capture.target_info = backend.target_info();
    cancel.check()?;

    capture.enter(SessionState::Running);
    let start = Instant::now();
    let output = backend.run(&capture.command)?;
    capture.elapsed = start.elapsed();
    capture.command_line = output.command_line;
    capture.stdout = output.stdout;
    capture.stderr = output.stderr;
    capture.exit_code = output.exit_code;
    if !capture.target_succeeded() {
        warn!(
            "perf exited with status {:?} after {:?}",
            capture.exit_code, capture.elapsed
        );
    }
    cancel.check()?;

    match post_process(backend, request, run_dir, options, &mut capture) {
        Ok(()) => {}
        Err(e @ (CaptureError::Cancelled | CaptureError::Integrity(_))) => return Err(e),
        Err(e) => {
            warn!("post-processing failed, recording the run without a profile: {e}");
            capture.profile = None;
            capture.profile_path = None;
            capture.post_processing_error = Some(e.to_string());
        }
    }
    Ok(capture)
}

fn post_process<B: Backend + ?Sized>(
    backend: &mut B,
    request: &CaptureRequest,
    run_dir: &Path,
    options: &CaptureOptions,
    capture: &mut Capture,
) -> Result<()> {
    let collected = backend.collect(&capture.command, run_dir)?;
    capture.report = collected.c2c_report;
    capture.enter(SessionState::Collected);
    options.cancel.check()?;

    let mut profile = match &collected.script {
        Some(path) => {
            let reader = BufReader::new(File::open(path)?);
            let parse_options = ParseOptions {
                mapping_bounds: options.mapping_bounds,
            };
            let profile = perf_script::parse_with(reader, parse_options)?;
            debug!(
                "parsed {} samples over {} locations",
                profile.samples.len(),
                profile.locations.len()
            );
            capture.enter(SessionState::Parsed);
            Some(profile)
        }
        None => None,
    };
    options.cancel.check()?;

    let store = ArtifactStore::open(run_dir)?;
    let mut archived: HashSet<String> = HashSet::new();

    // The launched binary is local in every backend that launches.
    if let Target::Launch { binary, .. } = &request.target {
        match store.archive_file(Path::new(binary)) {
            Ok(artifact) => {
                let archived_path = artifact.path.to_string_lossy().into_owned();
                if let Some(profile) = profile.as_mut() {
                    let n = artifact::rewrite_profile(profile, basename(binary), &archived_path);
                    debug!("{n} mappings now point at {archived_path}");
                }
                archived.insert(archived_path);
                capture.artifacts.push(artifact);
            }
            Err(e) => warn!("could not archive {binary}, leaving its mappings as is: {e}"),
        }
    }

    if let Some(profile) = profile.as_mut() {
        let candidates: Vec<String> = profile
            .binary_paths()
            .into_iter()
            .filter(|p| !archived.contains(*p))
            .map(str::to_string)
            .collect();
        let mut rewrites = HashMap::new();
        for path in candidates {
            options.cancel.check()?;
            let bytes = match backend.read_binary(&path) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    debug!("binary {path} is not available, leaving its mapping as is");
                    continue;
                }
                Err(e @ CaptureError::Integrity(_)) => return Err(e),
                Err(e) => {
                    warn!("could not read {path}: {e}");
                    continue;
                }
            };
            let artifact = store.archive(&bytes, basename(&path))?;
            rewrites.insert(path, artifact.path.to_string_lossy().into_owned());
            capture.artifacts.push(artifact);
        }
        artifact::rewrite_exact(profile, &rewrites);
    }
    capture.enter(SessionState::Archived);

    if let Some(profile) = profile {
        let path = run_dir.join(pprof::PROFILE_FILE);
        pprof::write_file(&profile, &path)?;
        info!("wrote profile to {}", path.display());
        capture.profile_path = Some(path);
        capture.profile = Some(profile);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf_cmd::PerfMode;
    use std::fs;
    use tempfile::TempDir;

    const SCRIPT: &str = "\
app 100 1.000000: 1 cycles:
\t401000 main+0x10 (/srv/app)
\t7f0000001000 __libc_start_main+0x80 (/usr/lib/libc.so.6)

app 100 1.000100: 1 cycles:
\t401000 main+0x10 (/srv/app)
\t7f0000001000 __libc_start_main+0x80 (/usr/lib/libc.so.6)
";

    /// Backend replaying canned outputs.
    #[derive(Default)]
    struct Replay {
        exit_code: Option<i32>,
        script: Option<&'static str>,
        binaries: Vec<(&'static str, &'static [u8])>,
        fail_prepare: bool,
        fail_collect: bool,
        tamper: bool,
        cancel_on_run: Option<CancelToken>,
        cleaned: usize,
        read: Vec<String>,
    }

    impl Backend for Replay {
        fn kind(&self) -> RunKind {
            RunKind::Ssh
        }

        fn target_info(&self) -> TargetInfo {
            TargetInfo {
                host: Some("replay".into()),
                ..Default::default()
            }
        }

        fn prepare(&mut self, request: &CaptureRequest, _cancel: &CancelToken) -> Result<PerfCommand> {
            if self.fail_prepare {
                return Err(CaptureError::InvalidRequest("no perf".into()));
            }
            Ok(PerfCommand::from(request))
        }

        fn run(&mut self, command: &PerfCommand) -> Result<RunOutput> {
            if let Some(cancel) = &self.cancel_on_run {
                cancel.cancel();
            }
            Ok(RunOutput {
                command_line: command.shell("perf.data")?,
                stdout: b"hello\n".to_vec(),
                stderr: b"perf done\n".to_vec(),
                exit_code: self.exit_code,
            })
        }

        fn collect(&mut self, _command: &PerfCommand, run_dir: &Path) -> Result<CollectedTrace> {
            if self.fail_collect {
                return Err(CaptureError::InvalidRequest("perf script crashed".into()));
            }
            let script = match self.script {
                Some(text) => {
                    let path = run_dir.join("perf.script");
                    fs::write(&path, text)?;
                    Some(path)
                }
                None => None,
            };
            Ok(CollectedTrace {
                script,
                c2c_report: None,
            })
        }

        fn read_binary(&mut self, path: &str) -> Result<Option<Vec<u8>>> {
            self.read.push(path.to_string());
            if self.tamper {
                return Err(crate::error::IntegrityError::Mismatch {
                    path: path.into(),
                    remote: "a".into(),
                    local: "b".into(),
                }
                .into());
            }
            Ok(self
                .binaries
                .iter()
                .find(|(p, _)| *p == path)
                .map(|(_, bytes)| bytes.to_vec()))
        }

        fn cleanup(&mut self) -> Vec<String> {
            self.cleaned += 1;
            Vec::new()
        }
    }

    fn record_request() -> CaptureRequest {
        CaptureRequest::new(
            PerfMode::Record {
                event: None,
                count: None,
            },
            Target::Attach { pids: vec![100] },
        )
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(CaptureError::Cancelled)));
    }

    #[test]
    fn test_full_session() {
        let tmp = TempDir::new().unwrap();
        let mut backend = Replay {
            exit_code: Some(0),
            script: Some(SCRIPT),
            binaries: vec![("/srv/app", b"app-bytes".as_slice())],
            ..Default::default()
        };
        let capture = run_capture(&mut backend, &record_request(), tmp.path(), &CaptureOptions::default()).unwrap();

        assert_eq!(
            capture.state_history,
            [
                SessionState::Idle,
                SessionState::Prepared,
                SessionState::Running,
                SessionState::Collected,
                SessionState::Parsed,
                SessionState::Archived,
                SessionState::Cleaned,
            ]
        );
        assert_eq!(backend.cleaned, 1);
        assert_eq!(backend.read, ["/srv/app", "/usr/lib/libc.so.6"]);
        assert_eq!(capture.artifacts.len(), 1);
        assert_eq!(capture.target_info.host.as_deref(), Some("replay"));

        let profile = capture.profile.as_ref().unwrap();
        assert_eq!(profile.samples.len(), 1);
        assert_eq!(profile.total("cycles"), 2);
        let archived = capture.artifacts[0].path.to_string_lossy().into_owned();
        let paths = profile.binary_paths();
        assert!(paths.contains(&archived.as_str()));
        assert!(paths.contains(&"/usr/lib/libc.so.6"));

        let written = pprof::read_file(capture.profile_path.as_ref().unwrap()).unwrap();
        assert_eq!(written.samples, profile.samples);
    }

    #[test]
    fn test_target_failure_is_data() {
        let tmp = TempDir::new().unwrap();
        let mut backend = Replay {
            exit_code: Some(3),
            script: Some(SCRIPT),
            ..Default::default()
        };
        let capture = run_capture(&mut backend, &record_request(), tmp.path(), &CaptureOptions::default()).unwrap();
        assert_eq!(capture.exit_code, Some(3));
        assert!(!capture.target_succeeded());
        assert_eq!(capture.stderr, b"perf done\n");
        assert!(capture.profile.is_some());
    }

    #[test]
    fn test_collect_failure_degrades() {
        let tmp = TempDir::new().unwrap();
        let mut backend = Replay {
            exit_code: Some(0),
            fail_collect: true,
            ..Default::default()
        };
        let capture = run_capture(&mut backend, &record_request(), tmp.path(), &CaptureOptions::default()).unwrap();
        assert!(capture.profile.is_none());
        assert!(capture
            .post_processing_error
            .as_deref()
            .unwrap()
            .contains("perf script crashed"));
        assert_eq!(capture.stdout, b"hello\n");
        assert_eq!(backend.cleaned, 1);
        assert!(!tmp.path().join(pprof::PROFILE_FILE).exists());
    }

    #[test]
    fn test_prepare_failure_still_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let mut backend = Replay {
            fail_prepare: true,
            ..Default::default()
        };
        let err = run_capture(&mut backend, &record_request(), tmp.path(), &CaptureOptions::default()).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidRequest(_)));
        assert_eq!(backend.cleaned, 1);
    }

    #[test]
    fn test_integrity_failure_aborts() {
        let tmp = TempDir::new().unwrap();
        let mut backend = Replay {
            exit_code: Some(0),
            script: Some(SCRIPT),
            tamper: true,
            ..Default::default()
        };
        let err = run_capture(&mut backend, &record_request(), tmp.path(), &CaptureOptions::default()).unwrap_err();
        assert!(matches!(err, CaptureError::Integrity(_)));
        assert_eq!(backend.cleaned, 1);
    }

    #[test]
    fn test_cancel_during_run() {
        let tmp = TempDir::new().unwrap();
        let options = CaptureOptions::default();
        let mut backend = Replay {
            exit_code: Some(0),
            script: Some(SCRIPT),
            cancel_on_run: Some(options.cancel.clone()),
            ..Default::default()
        };
        let err = run_capture(&mut backend, &record_request(), tmp.path(), &options).unwrap_err();
        assert!(matches!(err, CaptureError::Cancelled));
        assert_eq!(backend.cleaned, 1);
    }

    #[test]
    fn test_launch_binary_is_archived_by_basename() {
        let tmp = TempDir::new().unwrap();
        let bin = tmp.path().join("app");
        fs::write(&bin, b"local build").unwrap();
        let run_dir = tmp.path().join("run");
        fs::create_dir(&run_dir).unwrap();

        let request = CaptureRequest::new(
            PerfMode::Record {
                event: None,
                count: None,
            },
            Target::Launch {
                binary: bin.to_string_lossy().into_owned(),
                args: vec![],
            },
        );
        let mut backend = Replay {
            exit_code: Some(0),
            script: Some(SCRIPT),
            ..Default::default()
        };
        let capture = run_capture(&mut backend, &request, &run_dir, &CaptureOptions::default()).unwrap();
        assert_eq!(capture.artifacts.len(), 1);
        assert_eq!(capture.artifacts[0].basename, "app");
        // Only libc is left to look up; /srv/app matched the launched binary.
        assert_eq!(backend.read, ["/usr/lib/libc.so.6"]);
    }

    #[test]
    fn test_unreadable_launch_binary_keeps_profile() {
        let tmp = TempDir::new().unwrap();
        let request = CaptureRequest::new(
            PerfMode::Record {
                event: None,
                count: None,
            },
            Target::Launch {
                binary: tmp.path().join("gone").to_string_lossy().into_owned(),
                args: vec![],
            },
        );
        let mut backend = Replay {
            exit_code: Some(0),
            script: Some(SCRIPT),
            binaries: vec![("/usr/lib/libc.so.6", b"libc".as_slice())],
            ..Default::default()
        };
        let capture = run_capture(&mut backend, &request, tmp.path(), &CaptureOptions::default()).unwrap();
        assert!(capture.post_processing_error.is_none());
        assert!(capture.profile_path.as_ref().unwrap().exists());
        assert_eq!(capture.state_history.last(), Some(&SessionState::Cleaned));

        // The remaining mappings are still archived.
        assert_eq!(capture.artifacts.len(), 1);
        assert_eq!(capture.artifacts[0].basename, "libc.so.6");
        let profile = capture.profile.unwrap();
        assert!(profile.binary_paths().contains(&"/srv/app"));
    }
}
