//! Translation from a capture request to a `perf` command line.
//!
//! There is one translator for every mode. The local backend execs the argv
//! directly and the remote backends run [`PerfCommand::shell`], which is the
//! same argv with each element shell quoted, so both invoke perf the same
//! way.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, TransportError};
use crate::transport::join;

pub const PERF: &str = "perf";

/// Default duration when attaching to running processes.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PerfMode {
    /// `perf stat`, counters only.
    Stat { events: Vec<String>, detail: bool },
    /// `perf record` with frame pointer call graphs.
    Record {
        event: Option<String>,
        count: Option<u64>,
    },
    /// `perf c2c record` for cache line contention.
    C2c {
        event: Option<String>,
        count: Option<u64>,
    },
}

impl PerfMode {
    /// Whether the mode writes a `perf.data` file.
    pub fn records(&self) -> bool {
        !matches!(self, PerfMode::Stat { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            PerfMode::Stat { .. } => "stat",
            PerfMode::Record { .. } => "record",
            PerfMode::C2c { .. } => "c2c",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// Launch `binary` under perf.
    Launch { binary: String, args: Vec<String> },
    /// Observe already running host PIDs for the request duration.
    Attach { pids: Vec<u32> },
    /// Observe every CPU for the request duration.
    SystemWide,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub mode: PerfMode,
    pub target: Target,
    pub duration: Duration,
}

impl CaptureRequest {
    pub fn new(mode: PerfMode, target: Target) -> Self {
        CaptureRequest {
            mode,
            target,
            duration: DEFAULT_DURATION,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Checks that hold before a backend has prepared anything. An attach
    /// request may arrive without PIDs when the backend resolves them.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if let Target::Launch { binary, .. } = &self.target {
            if binary.trim().is_empty() {
                return Err(invalid("no binary to launch"));
            }
        }
        if let PerfMode::Stat { events, .. } = &self.mode {
            if events.iter().any(|e| e.trim().is_empty()) {
                return Err(invalid("empty event name"));
            }
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> CaptureError {
    CaptureError::InvalidRequest(msg.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfCommand {
    pub mode: PerfMode,
    pub target: Target,
    pub duration: Duration,
}

impl From<&CaptureRequest> for PerfCommand {
    fn from(request: &CaptureRequest) -> Self {
        PerfCommand {
            mode: request.mode.clone(),
            target: request.target.clone(),
            duration: request.duration,
        }
    }
}

fn push_event(args: &mut Vec<String>, event: &Option<String>, count: &Option<u64>) {
    if let Some(event) = event {
        args.extend(["-e".to_string(), event.clone()]);
        if let Some(count) = count.filter(|c| *c > 0) {
            args.extend(["-c".to_string(), count.to_string()]);
        }
    }
}

impl PerfCommand {
    /// Checks on the final command, after the backend has filled in PIDs.
    pub fn validate(&self) -> Result<(), CaptureError> {
        match &self.target {
            Target::Attach { pids } if pids.is_empty() => Err(invalid("no pids to attach to")),
            Target::Attach { .. } | Target::SystemWide if self.duration.as_secs() == 0 => {
                Err(invalid("attaching needs a duration of at least one second"))
            }
            _ => Ok(()),
        }
    }

    /// Replace the launched binary, e.g. with its uploaded remote path.
    pub fn with_binary(mut self, path: &str) -> Self {
        if let Target::Launch { binary, .. } = &mut self.target {
            *binary = path.to_string();
        }
        self
    }

    /// perf arguments, without the leading `perf`. `output_path` is ignored
    /// for stat, which reports on stderr.
    pub fn args(&self, output_path: &str) -> Vec<String> {
        let mut args = Vec::new();
        match &self.mode {
            PerfMode::Stat { events, detail } => {
                args.push("stat".to_string());
                if *detail {
                    args.push("-d".to_string());
                }
                for event in events {
                    args.extend(["-e".to_string(), event.trim().to_string()]);
                }
            }
            PerfMode::Record { event, count } => {
                args.extend(["record", "-g", "--call-graph", "fp"].map(String::from));
                push_event(&mut args, event, count);
                args.extend(["-o".to_string(), output_path.to_string()]);
            }
            PerfMode::C2c { event, count } => {
                args.extend(["c2c", "record"].map(String::from));
                push_event(&mut args, event, count);
                args.extend(["-o".to_string(), output_path.to_string()]);
            }
        }

        let secs = self.duration.as_secs().to_string();
        match &self.target {
            Target::Launch { binary, args: target_args } => {
                args.extend(["--".to_string(), binary.clone()]);
                args.extend(target_args.iter().cloned());
            }
            Target::Attach { pids } => {
                let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
                args.extend(["-p".to_string(), pids.join(","), "sleep".to_string(), secs]);
            }
            Target::SystemWide => {
                args.extend(["-a".to_string(), "sleep".to_string(), secs]);
            }
        }
        args
    }

    /// The same command as one shell string.
    pub fn shell(&self, output_path: &str) -> Result<String, TransportError> {
        shell_command(&self.args(output_path))
    }
}

/// `perf script` over a recorded file.
pub fn script_args(input: &str) -> Vec<String> {
    ["script", "-i", input].map(String::from).to_vec()
}

/// Text report for a `perf c2c record` file.
pub fn c2c_report_args(input: &str) -> Vec<String> {
    ["c2c", "report", "--stdio", "-i", input].map(String::from).to_vec()
}

/// `perf` followed by each argument shell quoted.
pub fn shell_command(args: &[String]) -> Result<String, TransportError> {
    join(std::iter::once(PERF).chain(args.iter().map(String::as_str)))
}
