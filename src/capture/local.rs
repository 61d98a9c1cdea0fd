//! perf on this machine.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, info};

use super::{Backend, CancelToken, CollectedTrace, RunOutput};
use crate::error::{CaptureError, Result, TransportError};
use crate::perf_cmd::{self, CaptureRequest, PerfCommand, PerfMode, Target, PERF};
use crate::record::{RunKind, TargetInfo};
use crate::utils::{self, normalize_arch, normalize_os, ProcessOutput};

pub const DATA_FILE: &str = "perf.data";
pub const SCRIPT_FILE: &str = "perf.script";
pub const C2C_REPORT_FILE: &str = "c2c-report.txt";

pub struct LocalBackend {
    data_dir: PathBuf,
    perf: String,
    keep: bool,
    echo: bool,
    scratch: Vec<PathBuf>,
}

impl LocalBackend {
    /// perf writes its data file into `data_dir`, normally the run directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        LocalBackend {
            data_dir: data_dir.into(),
            perf: PERF.to_string(),
            keep: false,
            echo: true,
            scratch: Vec::new(),
        }
    }

    /// Keep `perf.data` and `perf.script` after the session.
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Mirror perf output to the terminal while it runs.
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Use another perf executable.
    pub fn perf(mut self, perf: impl Into<String>) -> Self {
        self.perf = perf.into();
        self
    }

    fn data_path(&self) -> PathBuf {
        self.data_dir.join(DATA_FILE)
    }

    fn perf_command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.perf);
        cmd.args(args);
        cmd
    }

    fn spawn_error(&self, source: io::Error) -> TransportError {
        TransportError::Spawn {
            program: self.perf.clone(),
            source,
        }
    }

    /// Run a perf post-processing command with stdout going to `out`.
    fn perf_into(&self, args: &[String], out: &Path) -> Result<()> {
        debug!("{} {} > {}", self.perf, args.join(" "), out.display());
        let file = File::create(out)?;
        let output = self
            .perf_command(args)
            .stdin(Stdio::null())
            .stdout(file)
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| self.spawn_error(e))?;
        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                command: format!("{} {}", self.perf, args.join(" ")),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(())
    }
}

impl Backend for LocalBackend {
    fn kind(&self) -> RunKind {
        RunKind::Local
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo {
            os: Some(normalize_os(std::env::consts::OS)),
            arch: Some(normalize_arch(std::env::consts::ARCH)),
            ..Default::default()
        }
    }

    fn prepare(&mut self, request: &CaptureRequest, _cancel: &CancelToken) -> Result<PerfCommand> {
        if let Target::Launch { binary, .. } = &request.target {
            if !Path::new(binary).is_file() {
                return Err(CaptureError::InvalidRequest(format!("{binary} is not a file")));
            }
        }
        fs::create_dir_all(&self.data_dir)?;
        Ok(PerfCommand::from(request))
    }

    fn run(&mut self, command: &PerfCommand) -> Result<RunOutput> {
        let data = self.data_path();
        let args = command.args(&data.to_string_lossy());
        let command_line = perf_cmd::shell_command(&args)?;
        info!("running {command_line}");
        if command.mode.records() {
            self.scratch.push(data);
        }

        let mut cmd = self.perf_command(&args);
        let result = if self.echo {
            utils::run_teed(&mut cmd)
        } else {
            cmd.stdin(Stdio::null()).output().map(|o| ProcessOutput {
                stdout: o.stdout,
                stderr: o.stderr,
                status: o.status.code(),
            })
        };
        let output = result.map_err(|e| self.spawn_error(e))?;

        Ok(RunOutput {
            command_line,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status,
        })
    }

    fn collect(&mut self, command: &PerfCommand, run_dir: &Path) -> Result<CollectedTrace> {
        let data = self.data_path().to_string_lossy().into_owned();
        match command.mode {
            PerfMode::Stat { .. } => Ok(CollectedTrace::default()),
            PerfMode::Record { .. } => {
                let script = run_dir.join(SCRIPT_FILE);
                self.scratch.push(script.clone());
                self.perf_into(&perf_cmd::script_args(&data), &script)?;
                Ok(CollectedTrace {
                    script: Some(script),
                    c2c_report: None,
                })
            }
            PerfMode::C2c { .. } => {
                let report = run_dir.join(C2C_REPORT_FILE);
                self.perf_into(&perf_cmd::c2c_report_args(&data), &report)?;
                Ok(CollectedTrace {
                    script: None,
                    c2c_report: Some(report),
                })
            }
        }
    }

    fn read_binary(&mut self, path: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn cleanup(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.keep {
            self.scratch.clear();
            return errors;
        }
        for path in self.scratch.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => debug!("removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => errors.push(format!("remove {}: {e}", path.display())),
            }
        }
        errors
    }
}
