//! Error types shared across the capture pipeline.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure talking to a remote host, either over SSH or through a
/// `kubectl exec` tunnel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {destination}: {stderr}")]
    Connect { destination: String, stderr: String },
    #[error("command `{command}` failed with status {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("remote directory {0} is in use by another session")]
    Busy(String),
    #[error("argument cannot be passed through a shell: {0:?}")]
    InvalidArgument(String),
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The only fatal parse condition is a header whose event or count can't be
/// recovered.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: malformed stack header: {reason}")]
    Header { line: usize, reason: String },
    #[error("failed to read perf script output: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("digest mismatch for {path}: remote {remote}, local {local}")]
    Mismatch {
        path: String,
        remote: String,
        local: String,
    },
    #[error("malformed remote digest for {path}: {output:?}")]
    MalformedDigest { path: String, output: String },
    #[error("invalid base64 payload for {path}: {reason}")]
    Encoding { path: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to encode profile: {0}")]
    Encode(#[source] protobuf::Error),
    #[error("failed to decode profile: {0}")]
    Decode(#[source] protobuf::Error),
    #[error("profile references missing {kind} id {id}")]
    DanglingReference { kind: &'static str, id: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("pod {0} has no node assigned")]
    NotScheduled(String),
    #[error("pod {0} exposes no container ids")]
    NoContainers(String),
    #[error("helper pod {name} failed: {phase}")]
    HelperFailed { name: String, phase: String },
    #[error("unexpected kubectl output: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Top level error for a capture session.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Kubernetes(#[from] KubeError),
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),
    #[error("capture cancelled")]
    Cancelled,
    #[error("invalid capture request: {0}")]
    InvalidRequest(String),
    #[error("no processes found for {0}")]
    NoProcesses(String),
    #[error("failed to write run record: {0}")]
    Record(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_keeps_stderr() {
        let err = TransportError::CommandFailed {
            command: "perf stat".into(),
            status: Some(1),
            stderr: "perf: command not found\n".into(),
        };
        assert!(err.to_string().contains("perf: command not found"));
    }

    #[test]
    fn test_header_error_reports_line() {
        let err = ParseError::Header {
            line: 7,
            reason: "missing count".into(),
        };
        assert!(err.to_string().starts_with("line 7:"));
    }

    #[test]
    fn test_capture_error_wraps_transport() {
        let err: CaptureError = TransportError::Busy("/cache/repo".into()).into();
        assert!(matches!(err, CaptureError::Transport(TransportError::Busy(_))));
    }
}
