//! Remote command execution.
//!
//! [`Channel`] is the seam between capture backends and the machine the
//! target runs on. [`ssh::SshChannel`] implements it over a multiplexed
//! OpenSSH connection, which also serves `kubectl exec` tunnels through a
//! proxy command.

pub mod ssh;
pub mod verified;

use std::borrow::Cow;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::TransportError;
use crate::utils::ProcessOutput;

pub use ssh::{SshChannel, SshOptions};
pub use verified::{fetch_verified, remote_digest, upload_verified};

/// Output of one remote command. A missing status means the command was
/// killed by a signal.
pub type CommandOutput = ProcessOutput;

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub trait Channel {
    /// Human readable name of the remote end, e.g. `user@host`.
    fn destination(&self) -> &str;

    /// Run a shell command and return its output whatever the exit status.
    fn run(&self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Like [`run`](Channel::run) but a non-zero exit is an error carrying
    /// stderr verbatim.
    fn run_checked(&self, command: &str) -> Result<CommandOutput, TransportError> {
        let output = self.run(command)?;
        if output.success() {
            Ok(output)
        } else {
            Err(TransportError::CommandFailed {
                command: command.to_string(),
                status: output.status,
                stderr: output.stderr_lossy(),
            })
        }
    }

    /// Run the profiled target. Implementations may mirror its output to the
    /// local terminal.
    fn run_interactive(&self, command: &str) -> Result<CommandOutput, TransportError> {
        self.run(command)
    }

    /// Run a command whose stdout is too large to buffer, copying it into
    /// `sink`. The returned output has an empty stdout.
    fn run_streaming(&self, command: &str, sink: &mut dyn Write) -> Result<CommandOutput, TransportError>;

    /// Run a command with `input` as its stdin.
    fn run_with_stdin(&self, command: &str, input: &mut dyn Read) -> Result<CommandOutput, TransportError>;

    /// Copy a local file to `remote`.
    fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Tear down the connection. Calling it twice is a no-op.
    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Quote one argument for a POSIX shell.
pub fn quote(arg: &str) -> Result<Cow<'_, str>, TransportError> {
    shlex::try_quote(arg).map_err(|_| TransportError::InvalidArgument(arg.replace('\0', "\\0")))
}

/// Quote and join arguments into one shell command line.
pub fn join<'a, I>(args: I) -> Result<String, TransportError>
where
    I: IntoIterator<Item = &'a str>,
{
    let quoted = args.into_iter().map(quote).collect::<Result<Vec<_>, _>>()?;
    Ok(quoted.join(" "))
}
