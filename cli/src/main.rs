//! MultiCopy - Command-line interface for the multi-destination copy engine.
//!
//! Copies one source directory to every `--dst` at once. Destination metadata
//! comes from the mounted disks, a precheck report is printed before the job
//! starts, and Ctrl-C cancels the job cooperatively.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use multicopy_engine::{
    evaluate, format_bytes, ChannelObserver, DestinationInfo, DestinationProbe, Engine,
    EngineParts, EngineProgress, EngineSettings, Job, JobStatus, MemoryRepository,
    PrecheckLevel, PrecheckReport, ProgressSnapshot, Repository, StaticSettings,
};
use sysinfo::Disks;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// MultiCopy - copy one directory to many destinations at once
#[derive(Parser, Debug)]
#[command(name = "multicopy")]
#[command(version = "0.1.0")]
#[command(about = "Copy a directory tree to several destinations in parallel")]
struct Args {
    /// Source directory
    #[arg(long, value_name = "PATH")]
    src: PathBuf,

    /// Destination directory; repeat for every destination
    #[arg(long, value_name = "PATH", required = true)]
    dst: Vec<PathBuf>,

    /// TOML settings file; flags below override it
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Exclusion pattern (`*` matches anything); repeatable
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Worker tasks per destination
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Copy without the in-memory read/write pipeline
    #[arg(long)]
    no_buffer: bool,

    /// Pipeline chunk size in MiB
    #[arg(long, value_name = "N")]
    chunk_size_mb: Option<usize>,

    /// Pipeline queue capacity in chunks
    #[arg(long, value_name = "N")]
    max_chunks: Option<usize>,

    /// Encrypt every file to `<name>.enc`
    #[arg(long)]
    encrypt: bool,

    /// Environment variable holding the encryption passphrase
    #[arg(long, value_name = "VAR", requires = "encrypt")]
    passphrase_env: Option<String>,

    /// Operator name recorded on the job
    #[arg(long, value_name = "NAME")]
    operator: Option<String>,

    /// Start even when the precheck reports failures
    #[arg(long)]
    force: bool,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,

    /// Write JSON log lines to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    json: bool,
}

/// How a CLI run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Precheck failures and no `--force`
    Blocked,
    Finished(JobStatus),
}

impl Outcome {
    fn exit_code(self) -> i32 {
        match self {
            Outcome::Blocked => 3,
            Outcome::Finished(JobStatus::Completed) => 0,
            Outcome::Finished(JobStatus::Canceled) => 130,
            Outcome::Finished(_) => 1,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(err) = init_logging(&args) {
        eprintln!("Error: {err:#}");
        std::process::exit(2);
    }

    let exit_code = match run_cli(&args).await {
        Ok(outcome) => outcome.exit_code(),
        Err(err) => {
            eprintln!("Error: {err:#}");
            2
        }
    };

    std::process::exit(exit_code);
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("multicopy={level},multicopy_engine={level}")))
        .context("Failed to create log filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    match &args.log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            registry
                .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false).json())
                .try_init()
        }
        None => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false).compact())
            .try_init(),
    }
    .context("Failed to install log subscriber")
}

/// Settings file (if any) with command-line overrides applied.
fn load_settings(args: &Args) -> anyhow::Result<EngineSettings> {
    let mut settings = match &args.settings {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings {}", path.display()))?;
            toml::from_str::<EngineSettings>(&text)
                .with_context(|| format!("Invalid settings file {}", path.display()))?
        }
        None => EngineSettings::default(),
    };

    if args.no_buffer {
        settings.buffer.enabled = false;
    }
    if let Some(workers) = args.workers {
        if workers == 0 {
            bail!("--workers must be at least 1");
        }
        settings.buffer.writer_workers_per_target = workers;
    }
    if let Some(chunk_size_mb) = args.chunk_size_mb {
        settings.buffer.chunk_size_mb = chunk_size_mb;
    }
    if let Some(max_chunks) = args.max_chunks {
        settings.buffer.max_chunks = max_chunks;
    }
    if args.encrypt {
        settings.encryption.enabled = true;
    }
    settings.exclusions.extend(args.exclude.iter().cloned());

    Ok(settings)
}

/// Passphrase for `--encrypt`, read through `lookup` from the named variable.
fn resolve_passphrase(
    args: &Args,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Option<String>> {
    if !args.encrypt {
        return Ok(None);
    }
    let Some(var) = &args.passphrase_env else {
        bail!("--encrypt needs --passphrase-env VAR");
    };
    match lookup(var) {
        Some(passphrase) if !passphrase.trim().is_empty() => Ok(Some(passphrase)),
        _ => bail!("Environment variable {var} is unset or empty"),
    }
}

/// Index of the mount point that is the longest prefix of `path`.
fn longest_mount<'a>(path: &Path, mounts: impl IntoIterator<Item = &'a Path>) -> Option<usize> {
    mounts
        .into_iter()
        .enumerate()
        .filter(|(_, mount)| path.starts_with(mount))
        .max_by_key(|(_, mount)| mount.as_os_str().len())
        .map(|(idx, _)| idx)
}

/// Describe a destination directory using the disk it lives on.
fn probe_destination(path: &Path, disks: &Disks) -> DestinationProbe {
    let Ok(root) = path.canonicalize() else {
        return DestinationProbe::unavailable(path.display().to_string());
    };
    if !root.is_dir() {
        return DestinationProbe::unavailable(path.display().to_string());
    }

    let id = root.display().to_string();
    let mut info = DestinationInfo::folder(id.clone(), root.clone());
    let disks = disks.list();
    if let Some(idx) = longest_mount(&root, disks.iter().map(|d| d.mount_point())) {
        let disk = &disks[idx];
        info.label = disk.name().to_string_lossy().into_owned();
        info.file_system = disk.file_system().to_string_lossy().into_owned();
        info.total_bytes = disk.total_space();
        info.free_bytes = disk.available_space();
        info.bus_hint = if disk.is_removable() { "USB" } else { "Unknown" }.to_string();
    }
    DestinationProbe::available(info)
}

async fn run_cli(args: &Args) -> anyhow::Result<Outcome> {
    let settings = load_settings(args)?;
    let passphrase = resolve_passphrase(args, |var| std::env::var(var).ok())?;

    let mut provider = StaticSettings::new(settings);
    provider.passphrase = passphrase;

    let repository = Arc::new(MemoryRepository::new());
    let (observer, progress_rx) = ChannelObserver::new();
    let engine = Engine::new(
        EngineParts::new(Arc::new(provider))
            .with_repository(repository.clone())
            .with_observer(Arc::new(observer)),
    );

    let metadata = engine
        .inspect_source(&args.src)
        .await
        .context("Source inspection failed")?;

    let disks = Disks::new_with_refreshed_list();
    let probes: Vec<DestinationProbe> = args
        .dst
        .iter()
        .map(|dst| probe_destination(dst, &disks))
        .collect();
    let report = evaluate(&args.src, &metadata, &probes);

    let mut job = Job::new(&args.src);
    job.operator_name = args.operator.clone();
    for finding in &report.findings {
        if let Err(err) = repository
            .add_validation_log(finding.to_validation_log(job.id))
            .await
        {
            warn!(error = %err, "failed to persist precheck finding");
        }
    }

    if !args.json {
        print_precheck(&report);
    }
    if report.blocks_start(args.force) {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "precheck": report }))?);
        }
        return Ok(Outcome::Blocked);
    }
    if report.fail_count() > 0 {
        warn!("starting despite precheck failures (--force)");
    }

    let destinations: Vec<DestinationInfo> = args
        .dst
        .iter()
        .zip(probes)
        .map(|(dst, probe)| {
            probe
                .info
                .unwrap_or_else(|| DestinationInfo::folder(dst.display().to_string(), dst.clone()))
        })
        .collect();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, canceling job");
                cancel.cancel();
            }
        }
    });

    let started = Instant::now();
    let handle = engine
        .start_job(job, destinations, cancel)
        .await
        .context("Job start failed")?;
    info!(job_id = %handle.job_id(), "job running");

    let printer = tokio::spawn(print_progress(progress_rx, args.json));
    let job = handle.wait().await.context("Job execution failed")?;
    // the engine holds the last progress sender
    drop(engine);
    printer.await.context("Progress printer failed")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "precheck": report, "job": job }))?
        );
    } else {
        print_summary(&job, started.elapsed());
    }

    Ok(Outcome::Finished(job.status))
}

fn print_precheck(report: &PrecheckReport) {
    for finding in &report.findings {
        let marker = match finding.level {
            PrecheckLevel::Pass => "ok  ",
            PrecheckLevel::Warn => "warn",
            PrecheckLevel::Fail => "FAIL",
        };
        eprintln!("  [{}] {}: {}", marker, finding.label, finding.message);
    }
    eprintln!("{}", report.summary());
    eprintln!();
}

/// Latest snapshot per destination.
#[derive(Debug, Default)]
struct ProgressTally {
    latest: BTreeMap<String, ProgressSnapshot>,
}

impl ProgressTally {
    fn absorb(&mut self, batch: EngineProgress) {
        for snapshot in batch.targets {
            self.latest.insert(snapshot.device_id.clone(), snapshot);
        }
    }

    fn planned(&self) -> u64 {
        self.latest.values().map(|s| s.bytes_planned).sum()
    }

    fn done(&self) -> u64 {
        self.latest.values().map(|s| s.bytes_ok + s.bytes_failed).sum()
    }

    fn line(&self) -> String {
        let planned = self.planned();
        let done = self.done();
        let speed: f64 = self.latest.values().map(|s| s.current_mbps).sum();
        let percent = if planned == 0 {
            0
        } else {
            (done as f64 / planned as f64 * 100.0) as u32
        };

        format!(
            "Progress: {} | {}/{} | {:.1} MB/s across {} destinations",
            progress_bar(percent),
            format_bytes(done),
            format_bytes(planned),
            speed,
            self.latest.len()
        )
    }
}

/// Print an aggregate progress line at most every 200ms until the channel
/// closes, then flush the last state.
async fn print_progress(mut rx: UnboundedReceiver<EngineProgress>, quiet: bool) -> ProgressTally {
    let mut tally = ProgressTally::default();
    let mut last_print: Option<Instant> = None;
    let mut unprinted = false;

    while let Some(batch) = rx.recv().await {
        tally.absorb(batch);
        unprinted = true;
        if quiet || last_print.is_some_and(|t| t.elapsed() < Duration::from_millis(200)) {
            continue;
        }
        last_print = Some(Instant::now());
        eprint!("\r{}", tally.line());
        let _ = std::io::Write::flush(&mut std::io::stderr());
        unprinted = false;
    }

    if unprinted && !quiet {
        eprint!("\r{}", tally.line());
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }
    tally
}

fn print_summary(job: &Job, elapsed: Duration) {
    eprintln!();
    eprintln!("Job {} finished: {}", job.id, job.status);
    for target in &job.targets {
        eprintln!(
            "  {} [{}]: {} ok, {} failed of {} (avg {:.1} MB/s, max {:.1} MB/s)",
            target.root_path.display(),
            target.status,
            format_bytes(target.bytes_ok),
            format_bytes(target.bytes_failed),
            format_bytes(target.bytes_planned),
            target.avg_mbps,
            target.max_mbps
        );
    }
    eprintln!(
        "Total: {} ok, {} failed of {}",
        format_bytes(job.bytes_ok),
        format_bytes(job.bytes_failed),
        format_bytes(job.bytes_planned)
    );
    eprintln!("Elapsed: {}", format_duration(elapsed));
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

fn progress_bar(percent: u32) -> String {
    let filled = (percent.min(100) / 5) as usize;
    let empty = 20 - filled;
    format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
}
