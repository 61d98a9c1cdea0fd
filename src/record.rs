//! Per-run directories and the `run.json` manifest.
//!
//! A run directory is self-contained: the profile, every archived binary,
//! the raw perf outputs and a manifest tying them to the capture parameters.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use data_encoding::HEXLOWER;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::capture::Capture;
use crate::error::CaptureError;
use crate::perf_cmd::{PerfMode, Target};
use crate::utils::git_toplevel;

pub const MANIFEST_FILE: &str = "run.json";
pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";
pub const PERF_STAT_FILE: &str = "perf-stat.txt";

/// History lives next to the repository the capture was started from.
const HISTORY_DIR: &str = ".perfcap/history";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Local,
    Ssh,
    Attach,
}

/// Where the capture ran. Fields that do not apply to a kind are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Profile,
    Binary,
    Stdout,
    Stderr,
    PerfStat,
    C2cReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub size: u64,
    /// File name relative to the run directory.
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    /// Seconds since the unix epoch.
    pub timestamp: u64,
    pub kind: RunKind,
    pub perf: PerfMode,
    pub target: Target,
    pub duration_secs: u64,
    pub command_line: String,
    pub target_info: TargetInfo,
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
    pub artifacts: Vec<ArtifactEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_processing_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_errors: Vec<String>,
}

/// 16 random bytes, hex encoded.
pub fn new_run_id() -> String {
    HEXLOWER.encode(&rand::random::<[u8; 16]>())
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `.perfcap/history` under the git top level containing `cwd`, or under
/// `cwd` itself outside a repository.
pub fn history_dir(cwd: &Path) -> PathBuf {
    git_toplevel(cwd)
        .unwrap_or_else(|| cwd.to_path_buf())
        .join(HISTORY_DIR)
}

/// Create `<history>/<timestamp>-<first 8 chars of id>`.
pub fn create_run_dir(history: &Path, id: &str, timestamp: u64) -> io::Result<PathBuf> {
    let short = id.get(..8).unwrap_or(id);
    let dir = history.join(format!("{timestamp}-{short}"));
    fs::create_dir_all(history)?;
    fs::create_dir(&dir)?;
    debug!("created run directory {}", dir.display());
    Ok(dir)
}

fn entry(run_dir: &Path, path: &Path, kind: ArtifactKind) -> io::Result<ArtifactEntry> {
    let size = fs::metadata(path)?.len();
    let file = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned();
    Ok(ArtifactEntry { kind, size, file })
}

impl RunRecord {
    /// Write the raw outputs of `capture` into `run_dir`, then the manifest
    /// listing every file of the run.
    pub fn persist(
        run_dir: &Path,
        id: &str,
        timestamp: u64,
        capture: &Capture,
    ) -> Result<RunRecord, CaptureError> {
        let mut artifacts = Vec::new();

        if let Some(path) = &capture.profile_path {
            artifacts.push(entry(run_dir, path, ArtifactKind::Profile)?);
        }
        for artifact in &capture.artifacts {
            artifacts.push(ArtifactEntry {
                kind: ArtifactKind::Binary,
                size: artifact.size,
                file: artifact.file_name(),
            });
        }
        if let Some(path) = &capture.report {
            artifacts.push(entry(run_dir, path, ArtifactKind::C2cReport)?);
        }

        let stdout = run_dir.join(STDOUT_FILE);
        fs::write(&stdout, &capture.stdout)?;
        artifacts.push(entry(run_dir, &stdout, ArtifactKind::Stdout)?);
        let stderr = run_dir.join(STDERR_FILE);
        fs::write(&stderr, &capture.stderr)?;
        artifacts.push(entry(run_dir, &stderr, ArtifactKind::Stderr)?);
        // perf stat reports on stderr.
        if matches!(capture.command.mode, PerfMode::Stat { .. }) {
            let stat = run_dir.join(PERF_STAT_FILE);
            fs::write(&stat, &capture.stderr)?;
            artifacts.push(entry(run_dir, &stat, ArtifactKind::PerfStat)?);
        }

        let record = RunRecord {
            id: id.to_string(),
            timestamp,
            kind: capture.kind,
            perf: capture.command.mode.clone(),
            target: capture.command.target.clone(),
            duration_secs: capture.command.duration.as_secs(),
            command_line: capture.command_line.clone(),
            target_info: capture.target_info.clone(),
            exit_code: capture.exit_code,
            elapsed_ms: millis(capture.elapsed),
            artifacts,
            post_processing_error: capture.post_processing_error.clone(),
            cleanup_errors: capture.cleanup_errors.clone(),
        };
        let manifest = run_dir.join(MANIFEST_FILE);
        fs::write(&manifest, serde_json::to_vec_pretty(&record)?)?;
        info!("run {} recorded in {}", record.id, run_dir.display());
        Ok(record)
    }

    pub fn load(run_dir: &Path) -> Result<RunRecord, CaptureError> {
        let data = fs::read(run_dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
