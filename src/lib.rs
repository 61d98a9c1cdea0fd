//! perfcap library - capture perf traces and archive them as pprof profiles.
//!
//! A capture runs `perf stat`, `perf record` or `perf c2c record` against a
//! local process, a process on an ssh host, or a Kubernetes pod reached
//! through a privileged helper pod. The trace is parsed into a
//! [`profile::Profile`] and written with every binary it references into a
//! self-contained run directory.
//!
//! # Modules
//!
//! - [`perf_script`] - `perf script` text to [`profile::Profile`]
//! - [`pprof`] - gzip-compressed `perftools.profiles.Profile` encoding
//! - [`artifact`] - content-addressed binary archive and mapping rewrite
//! - [`resolve`] - container to host PID resolution through `/proc`
//! - [`transport`] - multiplexed ssh with digest-checked transfers
//! - [`capture`] - capture sessions for each environment
//! - [`record`] - run directories and the `run.json` manifest
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::BufReader;
//! use std::path::Path;
//!
//! let script = BufReader::new(File::open("perf.script").unwrap());
//! let profile = perfcap::parse(script).unwrap();
//! perfcap::pprof::write_file(&profile, Path::new("perf.pb.gz")).unwrap();
//! ```

// Generated by build.rs from proto/perftools.proto.
include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));

pub mod artifact;
pub mod capture;
pub mod config;
pub mod error;
pub mod kube;
pub mod perf_cmd;
pub mod perf_script;
pub mod pprof;
pub mod profile;
pub mod record;
pub mod resolve;
pub mod transport;
pub mod trust;
pub mod utils;

pub use capture::{run_capture, Capture, CaptureOptions, CancelToken};
pub use config::Config;
pub use error::CaptureError;
pub use perf_script::parse;
