//! Small process and path helpers shared by the backends.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use sha2::{Digest, Sha256};

/// Lower-case hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// First `len` hex characters of the SHA-256 of `s`, used for short stable
/// identifiers in socket and directory names.
pub fn short_hash(s: &str, len: usize) -> String {
    let mut hex = sha256_hex(s.as_bytes());
    hex.truncate(len);
    hex
}

/// Read `reader` to the end on a background thread, echoing every chunk to
/// `echo` when one is supplied.
pub fn spawn_collector<R, W>(mut reader: R, mut echo: Option<W>) -> JoinHandle<io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let mut collected = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            collected.extend_from_slice(&buf[..n]);
            if let Some(out) = echo.as_mut() {
                // The terminal going away must not lose the captured output.
                if out.write_all(&buf[..n]).and_then(|_| out.flush()).is_err() {
                    echo = None;
                }
            }
        }
        Ok(collected)
    })
}

fn join_collector(handle: JoinHandle<io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| io::Error::other("output collector thread panicked"))?
}

/// Output of a finished child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: Option<i32>,
}

/// Run `cmd`, mirroring its output to our own stdout/stderr while capturing.
pub fn run_teed(cmd: &mut Command) -> io::Result<ProcessOutput> {
    let mut child = cmd
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = take_collector(&mut child, Stream::Stdout, Some(io::stdout()))?;
    let stderr = take_collector(&mut child, Stream::Stderr, Some(io::stderr()))?;
    finish(child, stdout, stderr)
}

/// Run `cmd` feeding it `input` on stdin.
pub fn run_with_input(cmd: &mut Command, input: &mut dyn Read) -> io::Result<ProcessOutput> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = take_collector(&mut child, Stream::Stdout, None::<io::Sink>)?;
    let stderr = take_collector(&mut child, Stream::Stderr, None::<io::Sink>)?;
    if let Some(mut stdin) = child.stdin.take() {
        match io::copy(input, &mut stdin) {
            Ok(_) => {}
            // The child exiting early is reported through its status.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e),
        }
    }
    finish(child, stdout, stderr)
}

/// Run `cmd` copying its stdout into `sink` instead of buffering it.
pub fn run_into(cmd: &mut Command, sink: &mut dyn Write) -> io::Result<ProcessOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stderr = take_collector(&mut child, Stream::Stderr, None::<io::Sink>)?;
    if let Some(mut stdout) = child.stdout.take() {
        if let Err(e) = io::copy(&mut stdout, sink) {
            // Reap the child before giving up on it.
            drop(stdout);
            let _ = child.kill();
            let _ = child.wait();
            let _ = join_collector(stderr);
            return Err(e);
        }
    }
    let status = child.wait()?;
    Ok(ProcessOutput {
        stdout: Vec::new(),
        stderr: join_collector(stderr)?,
        status: status.code(),
    })
}

enum Stream {
    Stdout,
    Stderr,
}

fn take_collector<W: Write + Send + 'static>(
    child: &mut Child,
    stream: Stream,
    echo: Option<W>,
) -> io::Result<JoinHandle<io::Result<Vec<u8>>>> {
    let missing = || io::Error::other("child output was not piped");
    Ok(match stream {
        Stream::Stdout => spawn_collector(child.stdout.take().ok_or_else(missing)?, echo),
        Stream::Stderr => spawn_collector(child.stderr.take().ok_or_else(missing)?, echo),
    })
}

fn finish(
    mut child: Child,
    stdout: JoinHandle<io::Result<Vec<u8>>>,
    stderr: JoinHandle<io::Result<Vec<u8>>>,
) -> io::Result<ProcessOutput> {
    let status = child.wait()?;
    Ok(ProcessOutput {
        stdout: join_collector(stdout)?,
        stderr: join_collector(stderr)?,
        status: status.code(),
    })
}

/// Top level of the git repository containing `dir`, if any.
pub fn git_toplevel(dir: &Path) -> Option<PathBuf> {
    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(dir)
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let top = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!top.is_empty()).then(|| PathBuf::from(top))
}

/// Normalize `uname -s` output to the os names used in run manifests.
pub fn normalize_os(uname_s: &str) -> String {
    uname_s.trim().to_ascii_lowercase()
}

/// Normalize `uname -m` output to the arch names used in run manifests.
pub fn normalize_arch(uname_m: &str) -> String {
    match uname_m.trim() {
        "x86_64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        "i386" | "i686" => "386".to_string(),
        "armv7l" => "arm".to_string(),
        other => other.to_string(),
    }
}
