use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};

use perfcap::capture::{session_control_key, AttachBackend, AttachTarget, Backend, LocalBackend, SshBackend};
use perfcap::kube::Kubectl;
use perfcap::perf_cmd::{CaptureRequest, PerfMode, Target};
use perfcap::perf_script::{self, ParseOptions};
use perfcap::pprof;
use perfcap::profile::MappingBounds;
use perfcap::record::{self, RunRecord};
use perfcap::transport::{SshChannel, SshOptions};
use perfcap::utils::git_toplevel;
use perfcap::{run_capture, CancelToken, CaptureOptions, Config};

#[derive(Debug, Parser)]
#[command(name = "perfcap")]
#[command(about = "Capture perf traces locally, over ssh or in Kubernetes pods")]
#[command(version)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Write mapping bounds from the observed address range instead of the
    /// full address space
    #[arg(long, global = true)]
    observed_bounds: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert `perf script` output to a gzip-compressed pprof profile
    Parse {
        /// perf script text file
        script: PathBuf,

        /// Output profile
        #[arg(short, long, default_value = pprof::PROFILE_FILE)]
        output: PathBuf,
    },
    /// Capture on this machine, or on an ssh host with --host
    Run {
        /// ssh destination, e.g. user@host
        #[arg(long)]
        host: Option<String>,

        /// ssh identity file
        #[arg(short, long, requires = "host")]
        identity_file: Option<PathBuf>,

        #[command(flatten)]
        perf: PerfArgs,

        #[command(flatten)]
        target: TargetArgs,

        /// Binary to launch under perf, followed by its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Capture a Kubernetes pod or node through a privileged helper pod
    Attach {
        /// Target pod
        #[arg(long, conflicts_with = "node", required_unless_present = "node")]
        pod: Option<String>,

        /// Target node
        #[arg(long)]
        node: Option<String>,

        /// Helper pod image; needs perf, sshd and bash
        #[arg(long)]
        image: String,

        #[arg(short, long, default_value = "default")]
        namespace: String,

        /// kubectl context
        #[arg(long)]
        context: Option<String>,

        /// Seconds to wait for the helper pod
        #[arg(long, default_value = "300")]
        ready_timeout: u64,

        /// Host PIDs to attach to on --node; the whole node when omitted
        #[arg(short, long, value_delimiter = ',', requires = "node")]
        pid: Vec<u32>,

        #[command(flatten)]
        perf: PerfArgs,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Stat,
    Record,
    C2c,
}

#[derive(Debug, Args)]
struct PerfArgs {
    /// perf mode
    #[arg(short, long, value_enum, default_value = "record")]
    mode: ModeArg,

    /// Event(s); stat accepts several, record and c2c one
    #[arg(short, long = "event")]
    events: Vec<String>,

    /// Sample period for record and c2c
    #[arg(short, long)]
    count: Option<u64>,

    /// perf stat -d
    #[arg(long)]
    detail: bool,

    /// Seconds to record when attaching
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Keep remote directories, helper pods and raw perf files
    #[arg(long)]
    keep: bool,
}

#[derive(Debug, Args)]
struct TargetArgs {
    /// Attach to running PIDs instead of launching a binary
    #[arg(short, long, value_delimiter = ',', conflicts_with = "system_wide")]
    pid: Vec<u32>,

    /// Record every CPU
    #[arg(short = 'a', long)]
    system_wide: bool,
}

impl PerfArgs {
    fn mode(&self) -> Result<PerfMode> {
        let single = || -> Result<Option<String>> {
            match self.events.as_slice() {
                [] => Ok(None),
                [event] => Ok(Some(event.clone())),
                _ => bail!("{:?} takes a single event", self.mode),
            }
        };
        Ok(match self.mode {
            ModeArg::Stat => PerfMode::Stat {
                events: self.events.clone(),
                detail: self.detail,
            },
            ModeArg::Record => PerfMode::Record {
                event: single()?,
                count: self.count,
            },
            ModeArg::C2c => PerfMode::C2c {
                event: single()?,
                count: self.count,
            },
        })
    }

    fn request(&self, target: Target) -> Result<CaptureRequest> {
        Ok(CaptureRequest::new(self.mode()?, target).with_duration(Duration::from_secs(self.duration)))
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over -v.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn launch_target(target: &TargetArgs, command: Vec<String>) -> Result<Target> {
    match (command.split_first(), target.pid.is_empty(), target.system_wide) {
        (Some((binary, args)), true, false) => Ok(Target::Launch {
            binary: binary.clone(),
            args: args.to_vec(),
        }),
        (None, false, false) => Ok(Target::Attach {
            pids: target.pid.clone(),
        }),
        (None, true, true) => Ok(Target::SystemWide),
        (None, true, false) => bail!("give a binary to launch, --pid or --system-wide"),
        _ => bail!("a launched binary cannot be combined with --pid or --system-wide"),
    }
}

fn cancel_on_interrupt() -> Result<CancelToken> {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupted, cleaning up");
        token.cancel();
    })
    .context("Error setting Ctrl-C handler")?;
    Ok(cancel)
}

fn run_session(
    backend: &mut dyn Backend,
    request: &CaptureRequest,
    run_dir: &Path,
    id: &str,
    timestamp: u64,
    options: &CaptureOptions,
) -> Result<()> {
    let capture = run_capture(backend, request, run_dir, options)
        .with_context(|| format!("capture failed, partial output in {}", run_dir.display()))?;
    let record = RunRecord::persist(run_dir, id, timestamp, &capture)?;

    println!("Run {} recorded in {}", record.id, run_dir.display());
    if let Some(path) = &capture.profile_path {
        println!("Profile: {}", path.display());
    }
    if let Some(path) = &capture.report {
        println!("c2c report: {}", path.display());
    }
    if let Some(e) = &capture.post_processing_error {
        println!("Post-processing failed: {e}");
    }
    if !capture.target_succeeded() {
        bail!("perf exited with status {:?}", capture.exit_code);
    }
    Ok(())
}

fn parse_command(script: &Path, output: &Path, bounds: MappingBounds) -> Result<()> {
    let file = File::open(script).with_context(|| format!("Failed to open {}", script.display()))?;
    let profile = perf_script::parse_with(BufReader::new(file), ParseOptions { mapping_bounds: bounds })
        .with_context(|| format!("Failed to parse {}", script.display()))?;
    pprof::write_file(&profile, output)?;
    println!(
        "Wrote {} samples ({} event types) to {}",
        profile.samples.len(),
        profile.sample_types.len(),
        output.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config {
        verbosity: cli.verbose,
        ..Default::default()
    };
    if cli.observed_bounds {
        config.mapping_bounds = MappingBounds::Observed;
    }

    if let Commands::Parse { script, output } = &cli.command {
        return parse_command(script, output, config.mapping_bounds);
    }

    let cwd = env::current_dir()?;
    let history = record::history_dir(&cwd);
    let id = record::new_run_id();
    let timestamp = record::unix_timestamp();
    let run_dir = record::create_run_dir(&history, &id, timestamp)
        .with_context(|| format!("Failed to create a run directory in {}", history.display()))?;
    info!("run {id} in {}", run_dir.display());

    let options = CaptureOptions {
        mapping_bounds: config.mapping_bounds,
        cancel: cancel_on_interrupt()?,
    };

    match cli.command {
        Commands::Parse { .. } => Ok(()),
        Commands::Run {
            host,
            identity_file,
            perf,
            target,
            command,
        } => {
            config.keep = perf.keep;
            let request = perf.request(launch_target(&target, command)?)?;
            match host {
                None => {
                    let mut backend = LocalBackend::new(&run_dir).keep(config.keep);
                    run_session(&mut backend, &request, &run_dir, &id, timestamp, &options)
                }
                Some(host) => {
                    let repo_root = git_toplevel(&cwd).unwrap_or_else(|| cwd.clone());
                    let session = id.get(..8).unwrap_or(&id);
                    let mut ssh = SshOptions::new(config.control_dir())
                        .control_key(session_control_key(&repo_root, session));
                    ssh.control_persist.clone_from(&config.control_persist);
                    if let Some(identity) = identity_file {
                        ssh = ssh.identity_file(identity);
                    }
                    let channel = SshChannel::connect(&host, ssh)
                        .with_context(|| format!("Failed to connect to {host}"))?;
                    let mut backend = SshBackend::new(channel, repo_root, session).keep(config.keep);
                    run_session(&mut backend, &request, &run_dir, &id, timestamp, &options)
                }
            }
        }
        Commands::Attach {
            pod,
            node,
            image,
            namespace,
            context,
            ready_timeout,
            pid,
            perf,
        } => {
            config.keep = perf.keep;
            config.helper_image = Some(image);
            config.namespace = namespace;
            config.kube_context = context;
            config.ready_timeout = Duration::from_secs(ready_timeout);

            let target = match (pod, node) {
                (Some(name), _) => AttachTarget::Pod { name },
                (None, Some(name)) => AttachTarget::Node { name, pids: pid },
                (None, None) => bail!("give --pod or --node"),
            };
            // The backend fills in the PIDs it resolves.
            let request = perf.request(Target::Attach { pids: Vec::new() })?;
            let kubectl = Arc::new(Kubectl::new(config.kube_context.clone(), config.namespace.clone()));
            let mut backend = AttachBackend::new(kubectl, target, SshChannel::connect, &config)?;
            run_session(&mut backend, &request, &run_dir, &id, timestamp, &options)
        }
    }
}
