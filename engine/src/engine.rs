//! Job orchestration.
//!
//! `Engine::start_job` gathers the source tree, builds one `TargetContext`
//! per destination, and spawns them all. The returned `JobHandle` is how a
//! caller cancels, inspects, extends (`Engine::add_files_to_job`), and finally
//! waits for the job. Per-file failures stay inside the target that hit them;
//! only source and enumeration errors surface from `start_job`.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{Alert, AlertSink, AuditEvent, AuditSink, EventKind, TracingAlertSink, TracingAuditSink};
use crate::error::{EngineError, EngineResult};
use crate::exclusions::ExclusionSet;
use crate::fs_ops::{expand_paths, gather_files, GatherOutcome};
use crate::model::{
    DestinationInfo, ErrorLog, ItemAction, ItemLog, ItemStatus, Job, JobStatus, Severity,
    TargetFile, TransferState, ValidationLog,
};
use crate::pause::PauseGate;
use crate::pipeline::{copy_buffered, copy_direct, copy_encrypted, CopyScope};
use crate::precheck::SourceMetadata;
use crate::progress::{EngineProgress, NullObserver, ProgressObserver, ProgressSnapshot};
use crate::repository::{MemoryRepository, Repository};
use crate::settings::{EngineSettings, SettingsProvider};
use crate::target::{FileHandler, FileOutcome, TargetContext};
use crate::verifier;

const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(10);

/// Collaborators an `Engine` is built from.
pub struct EngineParts {
    pub repository: Arc<dyn Repository>,
    pub audit: Arc<dyn AuditSink>,
    pub alerts: Arc<dyn AlertSink>,
    pub settings: Arc<dyn SettingsProvider>,
    pub observer: Arc<dyn ProgressObserver>,
}

impl EngineParts {
    /// In-memory repository, tracing sinks, no progress observer.
    pub fn new(settings: Arc<dyn SettingsProvider>) -> Self {
        EngineParts {
            repository: Arc::new(MemoryRepository::new()),
            audit: Arc::new(TracingAuditSink),
            alerts: Arc::new(TracingAlertSink),
            settings,
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = repository;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }
}

struct EngineInner {
    repository: Arc<dyn Repository>,
    audit: Arc<dyn AuditSink>,
    alerts: Arc<dyn AlertSink>,
    settings: Arc<dyn SettingsProvider>,
    observer: Arc<dyn ProgressObserver>,
    gate: PauseGate,
}

impl EngineInner {
    fn audit(&self, kind: EventKind, message: String, severity: Severity, job_id: Uuid) {
        self.audit
            .record_event(AuditEvent::new(kind, message, severity).for_job(job_id));
    }

    fn emit(&self, job_id: Uuid, targets: Vec<ProgressSnapshot>) {
        self.observer.on_progress(&EngineProgress { job_id, targets });
    }

    async fn load_exclusions(&self, settings: &EngineSettings) -> EngineResult<ExclusionSet> {
        let mut patterns = match self.repository.exclusion_patterns().await {
            Ok(patterns) => patterns,
            Err(err) => {
                warn!(error = %err, "could not load stored exclusion patterns");
                Vec::new()
            }
        };
        patterns.extend(settings.exclusions.iter().cloned());
        ExclusionSet::new(patterns)
    }

    async fn log_skipped(&self, job_id: Uuid, outcome: &GatherOutcome) {
        for relative in &outcome.skipped {
            debug!(%job_id, path = %relative.display(), "excluded by pattern");
            best_effort(
                "validation log",
                self.repository
                    .add_validation_log(ValidationLog::skipped(job_id, relative)),
            )
            .await;
        }
    }
}

async fn best_effort<F>(what: &str, write: F)
where
    F: Future<Output = anyhow::Result<()>>,
{
    if let Err(err) = write.await {
        warn!(error = %err, "failed to persist {what}");
    }
}

/// Files and bytes actually enqueued by `Engine::add_files_to_job`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddFilesResult {
    pub file_count: usize,
    pub bytes_added: u64,
    pub bytes_by_destination: BTreeMap<String, u64>,
}

struct JobShared {
    job: Mutex<Job>,
    targets: Vec<Arc<TargetContext>>,
    active: AtomicBool,
    cancel: CancellationToken,
}

impl JobShared {
    fn job(&self) -> MutexGuard<'_, Job> {
        self.job.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A started job.
pub struct JobHandle {
    job_id: Uuid,
    shared: Arc<JobShared>,
    task: JoinHandle<Job>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Request cooperative cancellation of every destination.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// True while destinations are still running and accept late files.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        self.shared.targets.iter().map(|t| t.snapshot()).collect()
    }

    /// Wait for every destination to finish and return the final job record.
    pub async fn wait(self) -> EngineResult<Job> {
        Ok(self.task.await?)
    }
}

/// The multi-destination copy engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        Engine {
            inner: Arc::new(EngineInner {
                repository: parts.repository,
                audit: parts.audit,
                alerts: parts.alerts,
                settings: parts.settings,
                observer: parts.observer,
                gate: PauseGate::new(),
            }),
        }
    }

    /// Pause every reader and writer of every job on this engine.
    pub fn pause(&self) {
        self.inner.gate.pause();
    }

    pub fn resume(&self) {
        self.inner.gate.resume();
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.gate.set_paused(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.gate.is_paused()
    }

    /// Gather the source tree the way a job would and summarise it.
    pub async fn inspect_source(&self, root: impl Into<PathBuf>) -> EngineResult<SourceMetadata> {
        let settings = self.inner.settings.settings();
        let exclusions = self.inner.load_exclusions(&settings).await?;
        let root = root.into();
        let outcome = tokio::task::spawn_blocking(move || gather_files(&root, &exclusions)).await??;
        Ok(SourceMetadata::from_files(&outcome.files))
    }

    /// Start copying `job.source_root` to every destination.
    ///
    /// # Errors
    /// `NoDestinations`, source validation and enumeration errors, and
    /// invalid exclusion patterns. Per-file failures never surface here.
    pub async fn start_job(
        &self,
        mut job: Job,
        destinations: Vec<DestinationInfo>,
        cancel: CancellationToken,
    ) -> EngineResult<JobHandle> {
        if destinations.is_empty() {
            return Err(EngineError::NoDestinations);
        }

        let inner = &self.inner;
        let settings = inner.settings.settings();
        let exclusions = inner.load_exclusions(&settings).await?;

        let root = job.source_root.clone();
        let outcome = tokio::task::spawn_blocking(move || gather_files(&root, &exclusions)).await??;
        inner.log_skipped(job.id, &outcome).await;

        job.started_at = Some(Utc::now());
        job.bytes_ok = 0;
        job.bytes_failed = 0;

        if outcome.files.is_empty() {
            info!(job_id = %job.id, source = %job.source_root.display(), "no files to copy");
            job.status = JobStatus::Completed;
            job.bytes_planned = 0;
            job.ended_at = Some(Utc::now());
            best_effort("job", inner.repository.upsert_job(&job)).await;

            let job_id = job.id;
            let finished = job.clone();
            return Ok(JobHandle {
                job_id,
                shared: Arc::new(JobShared {
                    job: Mutex::new(job),
                    targets: Vec::new(),
                    active: AtomicBool::new(false),
                    cancel,
                }),
                task: tokio::spawn(async move { finished }),
            });
        }

        let encrypted = settings.encryption.enabled;
        let targets: Vec<Arc<TargetContext>> = destinations
            .into_iter()
            .map(|info| {
                let target = TargetContext::new(
                    job.id,
                    info,
                    settings.buffer.worker_slots(),
                    encrypted,
                    inner.gate.clone(),
                );
                target.enqueue_files(&outcome.files);
                Arc::new(target)
            })
            .collect();

        job.status = JobStatus::Running;
        job.bytes_planned = targets.iter().map(|t| t.bytes_planned()).sum();
        best_effort("job", inner.repository.upsert_job(&job)).await;

        info!(
            job_id = %job.id,
            files = outcome.files.len(),
            destinations = targets.len(),
            bytes_planned = job.bytes_planned,
            buffered = settings.buffer.enabled,
            encrypted,
            "job started"
        );
        inner.audit(
            EventKind::Transfer,
            format!("Job {} started", job.id),
            Severity::Info,
            job.id,
        );
        if settings.buffer.enabled {
            inner.audit(
                EventKind::BufferEnabled,
                "Buffering enabled".to_string(),
                Severity::Info,
                job.id,
            );
        } else {
            inner.audit(
                EventKind::BufferDisabled,
                "Buffering disabled".to_string(),
                Severity::Info,
                job.id,
            );
        }

        let job_id = job.id;
        let shared = Arc::new(JobShared {
            job: Mutex::new(job),
            targets,
            active: AtomicBool::new(true),
            cancel: cancel.clone(),
        });

        let worker = Arc::new(CopyWorker {
            inner: Arc::clone(inner),
            passphrase: inner.settings.unlocked_passphrase(),
            settings,
            cancel,
            persistence: TaskTracker::new(),
        });
        let task = tokio::spawn(drive(Arc::clone(&shared), worker));

        Ok(JobHandle {
            job_id,
            shared,
            task,
        })
    }

    /// `start_job` followed by `JobHandle::wait`.
    pub async fn run_job(
        &self,
        job: Job,
        destinations: Vec<DestinationInfo>,
        cancel: CancellationToken,
    ) -> EngineResult<Job> {
        self.start_job(job, destinations, cancel).await?.wait().await
    }

    /// Add files to a running job.
    ///
    /// Paths may be files or directories under the job's source root; others
    /// are ignored. Destination ids match case-insensitively. Destinations
    /// whose queue already completed take nothing.
    pub async fn add_files_to_job(
        &self,
        handle: &JobHandle,
        paths: &[PathBuf],
        destination_ids: &[String],
    ) -> EngineResult<AddFilesResult> {
        let shared = &handle.shared;
        if !handle.is_active() || shared.cancel.is_cancelled() {
            return Ok(AddFilesResult::default());
        }

        let targets: Vec<&Arc<TargetContext>> = shared
            .targets
            .iter()
            .filter(|t| {
                destination_ids
                    .iter()
                    .any(|id| id.eq_ignore_ascii_case(t.device_id()))
            })
            .collect();
        if targets.is_empty() {
            return Ok(AddFilesResult::default());
        }

        let inner = &self.inner;
        let settings = inner.settings.settings();
        let exclusions = inner.load_exclusions(&settings).await?;
        let root = shared.job().source_root.clone();
        let paths = paths.to_vec();
        let outcome =
            tokio::task::spawn_blocking(move || expand_paths(&root, &paths, &exclusions)).await??;
        inner.log_skipped(handle.job_id, &outcome).await;
        if outcome.files.is_empty() {
            return Ok(AddFilesResult::default());
        }

        let mut result = AddFilesResult::default();
        for target in &targets {
            let (count, bytes) = target.enqueue_files(&outcome.files);
            if count > 0 {
                result.file_count = result.file_count.max(count);
                result.bytes_added += bytes;
                result
                    .bytes_by_destination
                    .insert(target.device_id().to_string(), bytes);
            }
        }
        if result.bytes_added == 0 && result.file_count == 0 {
            return Ok(result);
        }

        let job = {
            let mut job = shared.job();
            job.bytes_planned += result.bytes_added;
            job.clone()
        };
        best_effort("job", inner.repository.upsert_job(&job)).await;
        for target in &targets {
            best_effort(
                "target",
                inner
                    .repository
                    .upsert_target(&target.to_result(&settings.mini_window)),
            )
            .await;
        }

        inner.emit(job.id, targets.iter().map(|t| t.snapshot()).collect());
        info!(
            job_id = %job.id,
            files = result.file_count,
            bytes_added = result.bytes_added,
            "files added to running job"
        );
        inner.audit(
            EventKind::FilesAddedToJob,
            format!(
                "Added {} files ({} bytes)",
                result.file_count, result.bytes_added
            ),
            Severity::Info,
            job.id,
        );

        Ok(result)
    }
}

/// Run every target to completion and settle the job record.
async fn drive(shared: Arc<JobShared>, worker: Arc<CopyWorker>) -> Job {
    let inner = Arc::clone(&worker.inner);
    let job_id = shared.job().id;
    let cancel = shared.cancel.clone();

    let ticker_stop = CancellationToken::new();
    let ticker = spawn_ticker(
        Arc::clone(&inner),
        job_id,
        shared.targets.clone(),
        Duration::from_millis(worker.settings.performance.progress_interval_ms)
            .max(MIN_PROGRESS_INTERVAL),
        cancel.clone(),
        ticker_stop.clone(),
    );

    let handler: Arc<dyn FileHandler> = worker.clone();
    let mut runs = JoinSet::new();
    for target in &shared.targets {
        runs.spawn(Arc::clone(target).run(Arc::clone(&handler), cancel.clone()));
    }
    while let Some(joined) = runs.join_next().await {
        if let Err(err) = joined {
            warn!(%job_id, error = %err, "target task ended abnormally");
        }
    }

    shared.active.store(false, Ordering::Release);
    ticker_stop.cancel();
    if let Err(err) = ticker.await {
        debug!(%job_id, error = %err, "progress ticker ended abnormally");
    }

    worker.persistence.close();
    worker.persistence.wait().await;

    // a token fired after every target settled does not undo their work
    let canceled = shared
        .targets
        .iter()
        .any(|t| t.status() == JobStatus::Canceled);
    let mini = &worker.settings.mini_window;
    let job = {
        let mut job = shared.job();
        job.status = if canceled {
            JobStatus::Canceled
        } else if shared.targets.iter().any(|t| t.has_errors()) {
            JobStatus::Error
        } else {
            JobStatus::Completed
        };
        job.bytes_planned = shared.targets.iter().map(|t| t.bytes_planned()).sum();
        job.bytes_ok = shared.targets.iter().map(|t| t.bytes_ok()).sum();
        job.bytes_failed = shared.targets.iter().map(|t| t.bytes_failed()).sum();
        job.targets = shared.targets.iter().map(|t| t.to_result(mini)).collect();
        job.ended_at = Some(Utc::now());
        job.clone()
    };

    best_effort("job", inner.repository.upsert_job(&job)).await;
    for target in &job.targets {
        best_effort("target", inner.repository.upsert_target(target)).await;
    }

    if canceled {
        inner.audit(
            EventKind::Transfer,
            format!("Job {} canceled", job.id),
            Severity::Warn,
            job.id,
        );
    } else {
        inner.emit(job.id, shared.targets.iter().map(|t| t.snapshot()).collect());
    }

    info!(
        job_id = %job.id,
        status = %job.status,
        bytes_ok = job.bytes_ok,
        bytes_failed = job.bytes_failed,
        "job finished"
    );
    job
}

fn spawn_ticker(
    inner: Arc<EngineInner>,
    job_id: Uuid,
    targets: Vec<Arc<TargetContext>>,
    period: Duration,
    cancel: CancellationToken,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if targets.iter().any(|t| t.active_workers() > 0) {
                        inner.emit(job_id, targets.iter().map(|t| t.snapshot()).collect());
                    }
                }
            }
        }
    })
}

/// The engine's per-file copy handler.
struct CopyWorker {
    inner: Arc<EngineInner>,
    settings: EngineSettings,
    passphrase: Option<String>,
    cancel: CancellationToken,
    persistence: TaskTracker,
}

impl CopyWorker {
    async fn transfer(&self, scope: CopyScope<'_>) -> EngineResult<()> {
        if scope.target.is_encrypted() {
            let passphrase = self
                .passphrase
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .ok_or(EngineError::EncryptionKeyUnavailable)?;
            // encrypted output is not re-verified
            return copy_encrypted(scope, passphrase).await;
        }

        if self.settings.buffer.enabled {
            copy_buffered(scope, &self.settings.buffer).await?;
        } else {
            copy_direct(scope).await?;
        }

        scope.target.set_state(TransferState::Verifying);
        if verifier::verify(&scope.file.source_path, &scope.file.destination_path).await {
            Ok(())
        } else {
            Err(EngineError::VerificationFailed {
                path: scope.file.destination_path.clone(),
            })
        }
    }

    fn item_log(&self, target: &TargetContext, file: &TargetFile, status: ItemStatus) -> ItemLog {
        ItemLog {
            job_id: target.job_id(),
            device_id: target.device_id().to_string(),
            action: if target.is_encrypted() {
                ItemAction::Encrypt
            } else {
                ItemAction::Copy
            },
            source: file.source_path.clone(),
            destination: file.destination_path.clone(),
            size_bytes: file.size_bytes,
            extension: file.extension(),
            status,
            ts: Utc::now(),
        }
    }

    async fn record_failure(&self, target: &TargetContext, file: &TargetFile, err: &EngineError) {
        let first_failure = target.mark_error_once();
        let repository = &self.inner.repository;
        warn!(
            job_id = %target.job_id(),
            device_id = target.device_id(),
            path = %file.source_path.display(),
            code = err.code(),
            error = %err,
            "file failed"
        );

        best_effort(
            "error log",
            repository.add_error_log(ErrorLog {
                job_id: target.job_id(),
                device_id: target.device_id().to_string(),
                file_path: file.source_path.clone(),
                error_code: err.code().to_string(),
                os_error: err.raw_os_error(),
                message: err.to_string(),
                ts: Utc::now(),
            }),
        )
        .await;
        best_effort(
            "item log",
            repository.add_item_log(self.item_log(target, file, ItemStatus::Failed)),
        )
        .await;

        if first_failure {
            let message = format!("Destination {} failed: {}", target.device_id(), err);
            self.inner.audit.record_event(
                AuditEvent::new(EventKind::TargetFailed, message.clone(), Severity::Critical)
                    .for_job(target.job_id())
                    .for_device(target.device_id()),
            );
            best_effort(
                "alert",
                self.inner.alerts.raise_alert(Alert {
                    message,
                    severity: Severity::Critical,
                    job_id: Some(target.job_id()),
                    device_id: Some(target.device_id().to_string()),
                }),
            )
            .await;
        }
    }
}

#[async_trait]
impl FileHandler for CopyWorker {
    async fn copy_file(
        &self,
        target: &TargetContext,
        file: &TargetFile,
        cancel: &CancellationToken,
    ) -> FileOutcome {
        let scope = CopyScope {
            target,
            file,
            gate: &self.inner.gate,
            cancel,
        };

        match self.transfer(scope).await {
            Ok(()) => {
                debug!(
                    device_id = target.device_id(),
                    path = %file.relative_path.display(),
                    bytes = file.size_bytes,
                    "file copied"
                );
                best_effort(
                    "item log",
                    self.inner
                        .repository
                        .add_item_log(self.item_log(target, file, ItemStatus::Ok)),
                )
                .await;
                FileOutcome::Copied
            }
            Err(err) if err.is_canceled() || cancel.is_cancelled() => FileOutcome::Abandoned,
            Err(err) => {
                self.record_failure(target, file, &err).await;
                FileOutcome::Failed
            }
        }
    }

    fn report(&self, target: &Arc<TargetContext>) {
        if self.cancel.is_cancelled() {
            return;
        }

        let snapshot = target.snapshot();
        let queue_warning = snapshot.queue_warning;
        self.inner.emit(target.job_id(), vec![snapshot]);

        if queue_warning && target.mark_slow_bus_alerted() {
            self.inner.audit.record_event(
                AuditEvent::new(
                    EventKind::TargetSlowUsb2,
                    format!("Destination {} on USB 2.0 with an active queue", target.device_id()),
                    Severity::Warn,
                )
                .for_job(target.job_id())
                .for_device(target.device_id()),
            );
        }

        if target.upsert_throttle.ready() {
            let repository = Arc::clone(&self.inner.repository);
            let result = target.to_result(&self.settings.mini_window);
            self.persistence.spawn(async move {
                best_effort("target", repository.upsert_target(&result)).await;
            });
        }

        if target.stats_throttle.ready() {
            if let Some(stats) = target.ram_stats() {
                let repository = Arc::clone(&self.inner.repository);
                self.persistence.spawn(async move {
                    best_effort("buffer stats", repository.add_ram_stats(stats)).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{MemoryAlertSink, MemoryAuditSink};
    use crate::encryptor::decrypt;
    use crate::settings::{BufferSettings, StaticSettings};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        engine: Engine,
        repository: Arc<MemoryRepository>,
        audit: Arc<MemoryAuditSink>,
        alerts: Arc<MemoryAlertSink>,
        progress_events: Arc<AtomicUsize>,
    }

    fn harness_with(provider: StaticSettings, repository: MemoryRepository) -> Harness {
        let repository = Arc::new(repository);
        let audit = Arc::new(MemoryAuditSink::default());
        let alerts = Arc::new(MemoryAlertSink::default());
        let progress_events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&progress_events);

        let engine = Engine::new(
            EngineParts::new(Arc::new(provider))
                .with_repository(repository.clone())
                .with_audit(audit.clone())
                .with_alerts(alerts.clone())
                .with_observer(Arc::new(move |_: &EngineProgress| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
        );

        Harness {
            engine,
            repository,
            audit,
            alerts,
            progress_events,
        }
    }

    fn settings(buffered: bool) -> EngineSettings {
        EngineSettings {
            buffer: BufferSettings {
                enabled: buffered,
                chunk_size_mb: 1,
                max_chunks: 2,
                writer_workers_per_target: 1,
            },
            ..EngineSettings::default()
        }
    }

    fn harness(settings: EngineSettings) -> Harness {
        harness_with(StaticSettings::new(settings), MemoryRepository::new())
    }

    fn write(path: &Path, len: usize) {
        fs::create_dir_all(path.parent().expect("parent")).expect("Failed to create dir");
        let data: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
        fs::write(path, data).expect("Failed to write file");
    }

    fn assert_bytes_balance(job: &Job) {
        for target in &job.targets {
            assert_eq!(
                target.bytes_ok + target.bytes_failed,
                target.bytes_planned,
                "target {} does not balance",
                target.device_id
            );
        }
        assert_eq!(job.bytes_ok + job.bytes_failed, job.bytes_planned);
    }

    #[tokio::test]
    async fn test_two_destinations_buffered() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("a.bin"), 2_500_000);
        write(&src.join("b.bin"), 1_048_576);
        write(&src.join("deep").join("c.bin"), 5_000_000);
        let total = 2_500_000 + 1_048_576 + 5_000_000;

        let h = harness(settings(true));
        let destinations = vec![
            DestinationInfo::folder("dev-a", temp.path().join("dst-a")),
            DestinationInfo::folder("dev-b", temp.path().join("dst-b")),
        ];
        let job = h
            .engine
            .run_job(Job::new(&src), destinations, CancellationToken::new())
            .await
            .expect("job runs");

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.bytes_planned, 2 * total as u64);
        assert_eq!(job.bytes_ok, 2 * total as u64);
        assert_bytes_balance(&job);
        for target in &job.targets {
            assert_eq!(target.status, JobStatus::Completed);
            assert_eq!(target.mini_opacity_percent, 90);
        }
        for dst in ["dst-a", "dst-b"] {
            for rel in ["a.bin", "b.bin", "deep/c.bin"] {
                assert_eq!(
                    fs::read(src.join(rel)).expect("src"),
                    fs::read(temp.path().join(dst).join(rel)).expect("dst")
                );
            }
        }

        let items = h.repository.item_logs();
        assert_eq!(items.len(), 6);
        assert!(items
            .iter()
            .all(|i| i.status == ItemStatus::Ok && i.action == ItemAction::Copy));
        assert_eq!(h.audit.count(EventKind::Transfer), 1);
        assert_eq!(h.audit.count(EventKind::BufferEnabled), 1);
        assert_eq!(
            h.repository.job(job.id).map(|j| j.status),
            Some(JobStatus::Completed)
        );
        assert_eq!(
            h.repository.target(job.id, "dev-b").map(|t| t.bytes_ok),
            Some(total as u64)
        );
        assert!(h.progress_events.load(Ordering::SeqCst) >= 6);
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_direct_path_without_buffering() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("one.txt"), 1000);

        let h = harness(settings(false));
        let job = h
            .engine
            .run_job(
                Job::new(&src),
                vec![DestinationInfo::folder("dev", temp.path().join("dst"))],
                CancellationToken::new(),
            )
            .await
            .expect("job runs");

        assert_eq!(job.status, JobStatus::Completed);
        assert!(temp.path().join("dst").join("one.txt").exists());
        assert_eq!(h.audit.count(EventKind::BufferDisabled), 1);
        assert_eq!(h.audit.count(EventKind::BufferEnabled), 0);
    }

    #[tokio::test]
    async fn test_failing_destination_is_isolated_and_alerts_once() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("a.txt"), 100);
        write(&src.join("sub").join("b.txt"), 200);
        write(&src.join("sub").join("c.txt"), 300);
        // a plain file where the destination root should be
        let blocked = temp.path().join("blocked");
        fs::write(&blocked, b"not a directory").expect("Failed to write blocker");

        let h = harness(settings(true));
        let job = h
            .engine
            .run_job(
                Job::new(&src),
                vec![
                    DestinationInfo::folder("good", temp.path().join("good")),
                    DestinationInfo::folder("bad", &blocked),
                ],
                CancellationToken::new(),
            )
            .await
            .expect("job runs");

        assert_eq!(job.status, JobStatus::Error);
        assert_bytes_balance(&job);
        let good = job.targets.iter().find(|t| t.device_id == "good").expect("good");
        let bad = job.targets.iter().find(|t| t.device_id == "bad").expect("bad");
        assert_eq!(good.status, JobStatus::Completed);
        assert_eq!(good.bytes_ok, 600);
        assert_eq!(bad.status, JobStatus::Error);
        assert_eq!(bad.bytes_failed, 600);

        assert_eq!(h.alerts.alerts().len(), 1);
        assert_eq!(h.audit.count(EventKind::TargetFailed), 1);
        let errors = h.repository.error_logs();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| e.device_id == "bad"));
        let failed_items = h
            .repository
            .item_logs()
            .into_iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .count();
        assert_eq!(failed_items, 3);
    }

    #[tokio::test]
    async fn test_exclusions_skip_and_log() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("keep.txt"), 10);
        write(&src.join("scratch.tmp"), 10);
        write(&src.join("cache").join("blob.bin"), 10);

        let mut engine_settings = settings(true);
        engine_settings.exclusions = vec!["cache/*".to_string()];
        let h = harness_with(
            StaticSettings::new(engine_settings),
            MemoryRepository::with_exclusions(["*.TMP"]),
        );

        let job = h
            .engine
            .run_job(
                Job::new(&src),
                vec![DestinationInfo::folder("dev", temp.path().join("dst"))],
                CancellationToken::new(),
            )
            .await
            .expect("job runs");

        assert_eq!(job.bytes_planned, 10);
        assert!(!temp.path().join("dst").join("scratch.tmp").exists());
        assert!(!temp.path().join("dst").join("cache").exists());
        let skipped = h.repository.validation_logs();
        assert_eq!(skipped.len(), 2);
        assert!(skipped.iter().all(|l| l.result == "SKIPPED"));
    }

    #[tokio::test]
    async fn test_empty_source_completes_immediately() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        fs::create_dir_all(&src).expect("Failed to create src");

        let h = harness(settings(true));
        let handle = h
            .engine
            .start_job(
                Job::new(&src),
                vec![DestinationInfo::folder("dev", temp.path().join("dst"))],
                CancellationToken::new(),
            )
            .await
            .expect("job starts");
        assert!(!handle.is_active());
        let job = handle.wait().await.expect("job finishes");

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.bytes_planned, 0);
        assert!(job.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_start_errors_surface_immediately() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let h = harness(settings(true));

        let missing = h
            .engine
            .start_job(
                Job::new(temp.path().join("missing")),
                vec![DestinationInfo::folder("dev", temp.path().join("dst"))],
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(missing, Err(EngineError::SourceNotFound { .. })));

        let no_destinations = h
            .engine
            .start_job(Job::new(temp.path()), Vec::new(), CancellationToken::new())
            .await;
        assert!(matches!(no_destinations, Err(EngineError::NoDestinations)));
    }

    #[tokio::test]
    async fn test_pause_holds_counters_until_resume() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("a.bin"), 300_000);

        let h = harness(settings(true));
        h.engine.pause();
        let handle = h
            .engine
            .start_job(
                Job::new(&src),
                vec![DestinationInfo::folder("dev", temp.path().join("dst"))],
                CancellationToken::new(),
            )
            .await
            .expect("job starts");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshots = handle.snapshots();
        assert_eq!(snapshots[0].bytes_ok, 0);
        assert_eq!(snapshots[0].state, TransferState::Paused);
        assert!(h.engine.is_paused());

        h.engine.resume();
        let job = handle.wait().await.expect("job finishes");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.bytes_ok, 300_000);
    }

    #[tokio::test]
    async fn test_cancel_marks_job_canceled_and_stops_progress() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("a.bin"), 100_000);
        write(&src.join("b.bin"), 50_000);

        let mut engine_settings = settings(true);
        engine_settings.performance.progress_interval_ms = 20;
        let h = harness(engine_settings);
        h.engine.pause();

        let cancel = CancellationToken::new();
        let handle = h
            .engine
            .start_job(
                Job::new(&src),
                vec![
                    DestinationInfo::folder("dev-a", temp.path().join("dst-a")),
                    DestinationInfo::folder("dev-b", temp.path().join("dst-b")),
                ],
                cancel.clone(),
            )
            .await
            .expect("job starts");

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let events_at_cancel = h.progress_events.load(Ordering::SeqCst);

        let job = handle.wait().await.expect("job finishes");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(job.status, JobStatus::Canceled);
        assert_bytes_balance(&job);
        assert_eq!(job.bytes_failed, 300_000);
        assert!(job.targets.iter().all(|t| t.status == JobStatus::Canceled));
        assert_eq!(h.progress_events.load(Ordering::SeqCst), events_at_cancel);
        assert!(h.repository.item_logs().is_empty());
        assert!(h.alerts.alerts().is_empty());
        assert_eq!(h.audit.count(EventKind::Transfer), 2);
    }

    #[tokio::test]
    async fn test_add_files_to_running_job() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("first.bin"), 1000);

        let h = harness(settings(true));
        h.engine.pause();
        let handle = h
            .engine
            .start_job(
                Job::new(&src),
                vec![
                    DestinationInfo::folder("DEV-A", temp.path().join("dst-a")),
                    DestinationInfo::folder("dev-b", temp.path().join("dst-b")),
                ],
                CancellationToken::new(),
            )
            .await
            .expect("job starts");

        write(&src.join("late").join("second.bin"), 500);
        write(&temp.path().join("outside.bin"), 700);
        let added = h
            .engine
            .add_files_to_job(
                &handle,
                &[src.join("late"), temp.path().join("outside.bin")],
                &["dev-a".to_string()],
            )
            .await
            .expect("files added");

        assert_eq!(added.file_count, 1);
        assert_eq!(added.bytes_added, 500);
        assert_eq!(added.bytes_by_destination.get("DEV-A"), Some(&500));
        assert!(!added.bytes_by_destination.contains_key("dev-b"));
        assert_eq!(h.audit.count(EventKind::FilesAddedToJob), 1);

        h.engine.resume();
        let job_id = handle.job_id();
        let job = handle.wait().await.expect("job finishes");

        assert_eq!(job.id, job_id);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.bytes_planned, 2500);
        assert_bytes_balance(&job);
        assert!(temp.path().join("dst-a").join("late").join("second.bin").exists());
        assert!(!temp.path().join("dst-b").join("late").exists());
    }

    #[tokio::test]
    async fn test_add_files_after_completion_enqueues_nothing() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("a.txt"), 10);

        let h = harness(settings(true));
        let handle = h
            .engine
            .start_job(
                Job::new(&src),
                vec![DestinationInfo::folder("dev", temp.path().join("dst"))],
                CancellationToken::new(),
            )
            .await
            .expect("job starts");

        while handle.is_active() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        write(&src.join("b.txt"), 10);
        let added = h
            .engine
            .add_files_to_job(&handle, &[src.join("b.txt")], &["dev".to_string()])
            .await
            .expect("call succeeds");
        assert_eq!(added, AddFilesResult::default());

        let job = handle.wait().await.expect("job finishes");
        assert_eq!(job.bytes_planned, 10);
    }

    #[tokio::test]
    async fn test_encrypted_job_writes_enc_files() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("secret.doc"), 70_000);

        let mut engine_settings = settings(true);
        engine_settings.encryption.enabled = true;
        let h = harness_with(
            StaticSettings::new(engine_settings).with_passphrase("4321"),
            MemoryRepository::new(),
        );
        let job = h
            .engine
            .run_job(
                Job::new(&src),
                vec![DestinationInfo::folder("dev", temp.path().join("dst"))],
                CancellationToken::new(),
            )
            .await
            .expect("job runs");

        assert_eq!(job.status, JobStatus::Completed);
        let sealed = fs::read(temp.path().join("dst").join("secret.doc.enc")).expect("enc file");
        let mut plain = Vec::new();
        decrypt(&mut sealed.as_slice(), &mut plain, "4321")
            .await
            .expect("decrypts");
        assert_eq!(plain, fs::read(src.join("secret.doc")).expect("src"));

        let items = h.repository.item_logs();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action, ItemAction::Encrypt);
        assert_eq!(items[0].extension, ".doc");
    }

    #[tokio::test]
    async fn test_encryption_without_passphrase_fails_files() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("a.txt"), 10);
        write(&src.join("b.txt"), 20);

        let mut engine_settings = settings(true);
        engine_settings.encryption.enabled = true;
        let h = harness(engine_settings);
        let job = h
            .engine
            .run_job(
                Job::new(&src),
                vec![DestinationInfo::folder("dev", temp.path().join("dst"))],
                CancellationToken::new(),
            )
            .await
            .expect("job runs");

        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.bytes_failed, 30);
        assert_eq!(h.alerts.alerts().len(), 1);
        assert!(h
            .repository
            .error_logs()
            .iter()
            .all(|e| e.error_code == "ENCRYPTION_KEY_UNAVAILABLE"));
    }

    #[tokio::test]
    async fn test_usb2_destination_warns_once() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        for name in ["1.txt", "2.txt", "3.txt"] {
            write(&src.join(name), 10);
        }
        let mut slow = DestinationInfo::folder("slow", temp.path().join("dst"));
        slow.bus_hint = "USB 2.0".to_string();

        let h = harness(settings(true));
        let handle = h
            .engine
            .start_job(Job::new(&src), vec![slow], CancellationToken::new())
            .await
            .expect("job starts");
        let job = handle.wait().await.expect("job finishes");

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.audit.count(EventKind::TargetSlowUsb2), 1);
    }

    #[tokio::test]
    async fn test_inspect_source_applies_exclusions() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("a.bin"), 100);
        write(&src.join("b.log"), 900);

        let mut engine_settings = settings(true);
        engine_settings.exclusions = vec!["*.log".to_string()];
        let h = harness(engine_settings);
        let meta = h.engine.inspect_source(&src).await.expect("inspect");

        assert_eq!(meta.file_count, 1);
        assert_eq!(meta.total_bytes, 100);
    }

    fn write_seeded(path: &Path, len: usize, seed: usize) {
        fs::create_dir_all(path.parent().expect("parent")).expect("Failed to create dir");
        let data: Vec<u8> = (0..len).map(|i| ((i + seed * 7) % 251) as u8).collect();
        fs::write(path, data).expect("Failed to write file");
    }

    async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_pause_mid_copy_freezes_every_destination() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        let names: Vec<String> = (0..300).map(|i| format!("batch/file-{i:03}.bin")).collect();
        for (i, name) in names.iter().enumerate() {
            write_seeded(&src.join(name), 300_000, i);
        }

        let h = harness(settings(true));
        let handle = h
            .engine
            .start_job(
                Job::new(&src),
                vec![
                    DestinationInfo::folder("dev-a", temp.path().join("dst-a")),
                    DestinationInfo::folder("dev-b", temp.path().join("dst-b")),
                ],
                CancellationToken::new(),
            )
            .await
            .expect("job starts");

        wait_until("first copied file on every destination", || {
            handle.snapshots().iter().all(|s| s.bytes_ok > 0)
        })
        .await;
        h.engine.pause();
        // files already past their last write may still settle
        tokio::time::sleep(Duration::from_millis(300)).await;

        let frozen = handle.snapshots();
        for snapshot in &frozen {
            assert!(snapshot.bytes_ok < snapshot.bytes_planned, "paused too late");
            assert_eq!(snapshot.state, TransferState::Paused);
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        let later = handle.snapshots();
        let before: Vec<u64> = frozen.iter().map(|s| s.bytes_ok).collect();
        let after: Vec<u64> = later.iter().map(|s| s.bytes_ok).collect();
        assert_eq!(before, after);
        assert!(later.iter().all(|s| s.state == TransferState::Paused));

        h.engine.resume();
        let job = handle.wait().await.expect("job finishes");

        assert_eq!(job.status, JobStatus::Completed);
        assert_bytes_balance(&job);
        for target in &job.targets {
            assert_eq!(target.bytes_planned, 300 * 300_000);
            assert_eq!(target.bytes_ok, target.bytes_planned);
        }
        for dst in ["dst-a", "dst-b"] {
            for name in &names {
                assert_eq!(
                    fs::read(src.join(name)).expect("src"),
                    fs::read(temp.path().join(dst).join(name)).expect("dst"),
                    "{dst}/{name} differs"
                );
            }
        }
    }

    /// Delegates to `MemoryRepository` and remembers every target status upserted.
    #[derive(Default)]
    struct RecordingRepository {
        records: MemoryRepository,
        target_statuses: Mutex<Vec<JobStatus>>,
    }

    #[async_trait]
    impl Repository for RecordingRepository {
        async fn upsert_job(&self, job: &Job) -> anyhow::Result<()> {
            self.records.upsert_job(job).await
        }

        async fn upsert_target(&self, target: &crate::model::TargetResult) -> anyhow::Result<()> {
            self.target_statuses
                .lock()
                .expect("lock")
                .push(target.status);
            self.records.upsert_target(target).await
        }

        async fn add_item_log(&self, log: ItemLog) -> anyhow::Result<()> {
            self.records.add_item_log(log).await
        }

        async fn add_error_log(&self, log: ErrorLog) -> anyhow::Result<()> {
            self.records.add_error_log(log).await
        }

        async fn add_validation_log(&self, log: ValidationLog) -> anyhow::Result<()> {
            self.records.add_validation_log(log).await
        }

        async fn add_ram_stats(&self, stats: crate::model::RamStats) -> anyhow::Result<()> {
            self.records.add_ram_stats(stats).await
        }
    }

    #[tokio::test]
    async fn test_running_job_persists_targets_and_buffer_stats() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("a.bin"), 2_500_000);
        write(&src.join("b.bin"), 2_500_000);
        write(&src.join("c.bin"), 2_500_000);

        let repository = Arc::new(RecordingRepository::default());
        let engine = Engine::new(
            EngineParts::new(Arc::new(StaticSettings::new(settings(true))))
                .with_repository(repository.clone()),
        );
        let job = engine
            .run_job(
                Job::new(&src),
                vec![DestinationInfo::folder("dev", temp.path().join("dst"))],
                CancellationToken::new(),
            )
            .await
            .expect("job runs");
        assert_eq!(job.status, JobStatus::Completed);

        let stats = repository.records.ram_stats();
        assert!(!stats.is_empty());
        for sample in &stats {
            assert_eq!(sample.job_id, job.id);
            assert_eq!(sample.device_id, "dev");
            // max_chunks queued plus one chunk waiting to be sent
            assert!((0..=3).contains(&sample.queue_depth), "depth {}", sample.queue_depth);
            assert!(sample.bytes_buffered >= 0);
        }

        let statuses = repository.target_statuses.lock().expect("lock").clone();
        assert!(statuses.contains(&JobStatus::Running), "{statuses:?}");
        assert_eq!(statuses.last(), Some(&JobStatus::Completed));
        assert_eq!(
            repository.records.target(job.id, "dev").map(|t| t.bytes_ok),
            Some(7_500_000)
        );
    }

    #[tokio::test]
    async fn test_concurrent_additions_while_workers_drain() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        for i in 0..20 {
            write_seeded(&src.join(format!("seed-{i:02}.bin")), 100_000, i);
        }

        let mut engine_settings = settings(true);
        engine_settings.buffer.writer_workers_per_target = 4;
        let h = harness(engine_settings);
        let handle = h
            .engine
            .start_job(
                Job::new(&src),
                vec![
                    DestinationInfo::folder("dev-a", temp.path().join("dst-a")),
                    DestinationInfo::folder("dev-b", temp.path().join("dst-b")),
                ],
                CancellationToken::new(),
            )
            .await
            .expect("job starts");

        let ids = vec!["dev-a".to_string(), "dev-b".to_string()];
        let mut accepted: BTreeMap<String, u64> = BTreeMap::new();
        let mut accepted_files = Vec::new();
        for round in 0..30 {
            let relative = PathBuf::from(format!("late-{round:02}.bin"));
            write_seeded(&src.join(&relative), 50_000 + round, round);
            let added = h
                .engine
                .add_files_to_job(&handle, &[src.join(&relative)], &ids)
                .await
                .expect("add files");
            for (device, bytes) in &added.bytes_by_destination {
                *accepted.entry(device.clone()).or_default() += bytes;
            }
            if added.file_count > 0 {
                accepted_files.push(relative);
            }
            tokio::task::yield_now().await;
        }

        let job = handle.wait().await.expect("job finishes");
        assert_eq!(job.status, JobStatus::Completed);
        assert_bytes_balance(&job);
        for target in &job.targets {
            let late = accepted.get(&target.device_id).copied().unwrap_or(0);
            assert_eq!(target.bytes_planned, 20 * 100_000 + late);
            assert_eq!(target.bytes_ok, target.bytes_planned);
        }
        for dst in ["dst-a", "dst-b"] {
            for relative in &accepted_files {
                assert_eq!(
                    fs::read(src.join(relative)).expect("src"),
                    fs::read(temp.path().join(dst).join(relative)).expect("dst"),
                );
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_after_targets_finish_keeps_job_completed() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        write(&src.join("a.txt"), 1000);

        let h = harness(settings(true));
        let cancel = CancellationToken::new();
        let handle = h
            .engine
            .start_job(
                Job::new(&src),
                vec![DestinationInfo::folder("dev", temp.path().join("dst"))],
                cancel.clone(),
            )
            .await
            .expect("job starts");

        wait_until("targets to finish", || !handle.is_active()).await;
        cancel.cancel();
        let job = handle.wait().await.expect("job finishes");

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.bytes_ok, 1000);
        assert_eq!(job.bytes_failed, 0);
        assert!(job.targets.iter().all(|t| t.status == JobStatus::Completed));
        assert_eq!(h.audit.count(EventKind::Transfer), 1);
    }
}
