//! Per-destination work queue, worker pool, and live counters.
//!
//! A `TargetContext` owns an unbounded FIFO of `TargetFile`s and runs
//! `worker_slots` worker tasks that drain it through a `FileHandler`. Queue
//! bookkeeping (the files, the pending count, and the completed flag) sits
//! behind a single mutex so that "last file finished" and "late enqueue" can
//! never interleave. Everything a progress reader looks at is atomic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fs_ops::destination_path;
use crate::model::{
    DestinationInfo, JobStatus, RamStats, SourceFile, TargetFile, TargetResult, TransferHealth,
    TransferState,
};
use crate::pause::PauseGate;
use crate::progress::ProgressSnapshot;
use crate::settings::MiniWindowSettings;

/// Bytes per MB for every throughput figure.
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
/// Below this current throughput a target is flagged `Warn`.
pub const LOW_THROUGHPUT_MBPS: f64 = 5.0;
/// Minimum spacing between throughput samples.
pub const SAMPLE_WINDOW: Duration = Duration::from_millis(500);

/// Result of handing one file to a `FileHandler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Copied,
    Failed,
    /// Canceled mid-file; neither counted nor logged.
    Abandoned,
}

/// Copies a single file for a target and reports progress.
#[async_trait]
pub trait FileHandler: Send + Sync {
    async fn copy_file(
        &self,
        target: &TargetContext,
        file: &TargetFile,
        cancel: &CancellationToken,
    ) -> FileOutcome;

    /// Called after every file outcome has been recorded.
    fn report(&self, target: &Arc<TargetContext>);
}

/// Lock-free "at most once per period" gate.
#[derive(Debug)]
pub struct Throttle {
    period_ms: u64,
    origin: Instant,
    last_ms: AtomicU64,
}

impl Throttle {
    const NEVER: u64 = u64::MAX;

    pub fn new(period: Duration) -> Self {
        Throttle {
            period_ms: period.as_millis() as u64,
            origin: Instant::now(),
            last_ms: AtomicU64::new(Self::NEVER),
        }
    }

    /// True for the first caller of each period.
    pub fn ready(&self) -> bool {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                if last == Self::NEVER || now.saturating_sub(last) >= self.period_ms {
                    Some(now)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

#[derive(Debug, Default)]
struct WorkQueue {
    files: VecDeque<TargetFile>,
    pending: usize,
    completed: bool,
}

enum Next {
    File(TargetFile),
    Wait,
    Done,
}

fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}

fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

/// One destination of a running job.
#[derive(Debug)]
pub struct TargetContext {
    job_id: Uuid,
    info: DestinationInfo,
    encrypted: bool,
    worker_slots: usize,
    gate: PauseGate,

    queue: Mutex<WorkQueue>,
    work_ready: Notify,
    queue_count: AtomicUsize,

    bytes_planned: AtomicU64,
    bytes_ok: AtomicU64,
    bytes_failed: AtomicU64,
    active_workers: AtomicUsize,
    buffered_bytes: AtomicI64,
    buffer_depth: AtomicI64,

    total_written: AtomicU64,
    first_write: OnceLock<Instant>,
    last_sample_ms: AtomicU64,
    last_sample_bytes: AtomicU64,
    current_mbps: AtomicU64,
    max_mbps: AtomicU64,
    avg_mbps: AtomicU64,

    state: AtomicU8,
    status: AtomicU8,
    has_errors: AtomicBool,
    error_alerted: AtomicBool,
    slow_bus_alerted: AtomicBool,
    started: OnceLock<Instant>,
    finished_after: OnceLock<Duration>,

    pub(crate) upsert_throttle: Throttle,
    pub(crate) stats_throttle: Throttle,
}

impl TargetContext {
    pub fn new(
        job_id: Uuid,
        info: DestinationInfo,
        worker_slots: usize,
        encrypted: bool,
        gate: PauseGate,
    ) -> Self {
        TargetContext {
            job_id,
            info,
            encrypted,
            worker_slots: worker_slots.max(1),
            gate,
            queue: Mutex::new(WorkQueue::default()),
            work_ready: Notify::new(),
            queue_count: AtomicUsize::new(0),
            bytes_planned: AtomicU64::new(0),
            bytes_ok: AtomicU64::new(0),
            bytes_failed: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            buffered_bytes: AtomicI64::new(0),
            buffer_depth: AtomicI64::new(0),
            total_written: AtomicU64::new(0),
            first_write: OnceLock::new(),
            last_sample_ms: AtomicU64::new(0),
            last_sample_bytes: AtomicU64::new(0),
            current_mbps: AtomicU64::new(0f64.to_bits()),
            max_mbps: AtomicU64::new(0f64.to_bits()),
            avg_mbps: AtomicU64::new(0f64.to_bits()),
            state: AtomicU8::new(TransferState::Idle.to_u8()),
            status: AtomicU8::new(JobStatus::Pending.to_u8()),
            has_errors: AtomicBool::new(false),
            error_alerted: AtomicBool::new(false),
            slow_bus_alerted: AtomicBool::new(false),
            started: OnceLock::new(),
            finished_after: OnceLock::new(),
            upsert_throttle: Throttle::new(Duration::from_secs(1)),
            stats_throttle: Throttle::new(Duration::from_secs(2)),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn device_id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &DestinationInfo {
        &self.info
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn worker_slots(&self) -> usize {
        self.worker_slots
    }

    pub fn bytes_planned(&self) -> u64 {
        self.bytes_planned.load(Ordering::Acquire)
    }

    pub fn bytes_ok(&self) -> u64 {
        self.bytes_ok.load(Ordering::Acquire)
    }

    pub fn bytes_failed(&self) -> u64 {
        self.bytes_failed.load(Ordering::Acquire)
    }

    pub fn queue_count(&self) -> usize {
        self.queue_count.load(Ordering::Acquire)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors.load(Ordering::Acquire)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Stored lifecycle state, ignoring the pause gate.
    pub fn state(&self) -> TransferState {
        TransferState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TransferState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    fn set_status(&self, status: JobStatus) {
        self.status.store(status.to_u8(), Ordering::Release);
    }

    fn lock_queue(&self) -> MutexGuard<'_, WorkQueue> {
        // queue bookkeeping stays consistent even if a holder panicked
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue files for this destination. Returns `(count, bytes)` actually
    /// enqueued; `(0, 0)` once the queue has completed.
    pub fn enqueue_files(&self, files: &[SourceFile]) -> (usize, u64) {
        let mut queue = self.lock_queue();
        if queue.completed || files.is_empty() {
            return (0, 0);
        }

        let mut bytes = 0u64;
        for file in files {
            queue.files.push_back(TargetFile {
                source_path: file.source_path.clone(),
                destination_path: destination_path(
                    &self.info.root_path,
                    &file.relative_path,
                    self.encrypted,
                ),
                relative_path: file.relative_path.clone(),
                size_bytes: file.size_bytes,
            });
            bytes += file.size_bytes;
        }
        queue.pending += files.len();
        self.bytes_planned.fetch_add(bytes, Ordering::AcqRel);
        self.queue_count.store(queue.pending, Ordering::Release);
        drop(queue);

        self.work_ready.notify_waiters();
        (files.len(), bytes)
    }

    /// True once the queue has drained (or the target finished) and no
    /// longer accepts files.
    pub fn is_queue_completed(&self) -> bool {
        self.lock_queue().completed
    }

    fn next_file(&self) -> Next {
        let mut queue = self.lock_queue();
        if let Some(file) = queue.files.pop_front() {
            return Next::File(file);
        }
        if queue.pending == 0 {
            queue.completed = true;
            return Next::Done;
        }
        if queue.completed {
            Next::Done
        } else {
            Next::Wait
        }
    }

    /// Count one finished file and decrement the pending counter.
    pub fn record_result(&self, outcome: FileOutcome, bytes: u64) {
        let mut queue = self.lock_queue();
        match outcome {
            FileOutcome::Copied => {
                self.bytes_ok.fetch_add(bytes, Ordering::AcqRel);
            }
            FileOutcome::Failed => {
                self.bytes_failed.fetch_add(bytes, Ordering::AcqRel);
                self.has_errors.store(true, Ordering::Release);
            }
            FileOutcome::Abandoned => return,
        }

        queue.pending = queue.pending.saturating_sub(1);
        self.queue_count.store(queue.pending, Ordering::Release);
        if queue.pending == 0 {
            queue.completed = true;
            drop(queue);
            self.work_ready.notify_waiters();
        }
    }

    /// Adjust buffered-byte and chunk-depth counters.
    pub fn buffer_reported(&self, bytes: i64, depth_delta: i64) {
        self.buffered_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.buffer_depth.fetch_add(depth_delta, Ordering::AcqRel);
    }

    pub fn buffered_bytes(&self) -> i64 {
        self.buffered_bytes.load(Ordering::Acquire)
    }

    pub fn buffer_depth(&self) -> i64 {
        self.buffer_depth.load(Ordering::Acquire)
    }

    /// Account written bytes and refresh throughput at most once per window.
    pub fn record_written(&self, bytes: u64) {
        let total = self.total_written.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let origin = *self.first_write.get_or_init(Instant::now);
        let now_ms = origin.elapsed().as_millis() as u64;

        let last_ms = self.last_sample_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last_ms) < SAMPLE_WINDOW.as_millis() as u64 {
            return;
        }
        if self
            .last_sample_ms
            .compare_exchange(last_ms, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let previous = self.last_sample_bytes.swap(total, Ordering::AcqRel);
        let window = (now_ms - last_ms) as f64 / 1000.0;
        let current = total.saturating_sub(previous) as f64 / window / BYTES_PER_MB;
        let average = total as f64 / (now_ms as f64 / 1000.0) / BYTES_PER_MB;

        store_f64(&self.current_mbps, current);
        store_f64(&self.avg_mbps, average);
        // non-negative f64 bit patterns order like the values they encode
        self.max_mbps.fetch_max(current.to_bits(), Ordering::AcqRel);
    }

    pub fn current_mbps(&self) -> f64 {
        load_f64(&self.current_mbps)
    }

    pub fn max_mbps(&self) -> f64 {
        load_f64(&self.max_mbps)
    }

    pub fn avg_mbps(&self) -> f64 {
        load_f64(&self.avg_mbps)
    }

    /// True for the first failure on this target only.
    pub fn mark_error_once(&self) -> bool {
        !self.error_alerted.swap(true, Ordering::AcqRel)
    }

    /// True the first time it is called.
    pub fn mark_slow_bus_alerted(&self) -> bool {
        !self.slow_bus_alerted.swap(true, Ordering::AcqRel)
    }

    /// Legacy bus with files still waiting.
    pub fn queue_warning(&self) -> bool {
        self.info.is_legacy_bus() && self.queue_count() > 0
    }

    pub fn health(&self) -> TransferHealth {
        if self.has_errors() {
            TransferHealth::Critical
        } else if self.info.is_legacy_bus() || self.current_mbps() < LOW_THROUGHPUT_MBPS {
            TransferHealth::Warn
        } else {
            TransferHealth::Ok
        }
    }

    pub fn elapsed(&self) -> Duration {
        if let Some(elapsed) = self.finished_after.get() {
            return *elapsed;
        }
        self.started
            .get()
            .map(Instant::elapsed)
            .unwrap_or(Duration::ZERO)
    }

    /// Remaining planned bytes at the current rate; `None` while idle.
    pub fn eta(&self) -> Option<Duration> {
        let current = self.current_mbps();
        let planned = self.bytes_planned();
        if current <= 0.0 || planned == 0 {
            return None;
        }
        let remaining = planned.saturating_sub(self.bytes_ok());
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        let seconds = remaining as f64 / (current * BYTES_PER_MB);
        Some(Duration::from_secs_f64(seconds.max(1.0)))
    }

    /// Immutable copy of the observable fields.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let planned = self.bytes_planned();
        let ok = self.bytes_ok();
        let stored = self.state();
        let state = if self.gate.is_paused() && stored.is_active() {
            TransferState::Paused
        } else {
            stored
        };

        ProgressSnapshot {
            device_id: self.info.id.clone(),
            label: self.info.display_label(),
            file_system: self.info.file_system.clone(),
            bus_hint: self.info.bus_hint.clone(),
            current_mbps: self.current_mbps(),
            max_mbps: self.max_mbps(),
            avg_mbps: self.avg_mbps(),
            queue_count: self.queue_count(),
            active_workers: self.active_workers(),
            worker_slots: self.worker_slots,
            progress: if planned == 0 {
                0.0
            } else {
                (ok as f64 / planned as f64).min(1.0)
            },
            bytes_ok: ok,
            bytes_failed: self.bytes_failed(),
            bytes_planned: planned,
            eta: self.eta(),
            state,
            health: self.health(),
            queue_warning: self.queue_warning(),
        }
    }

    /// Persisted view, carrying the mini-window preferences.
    pub fn to_result(&self, mini: &MiniWindowSettings) -> TargetResult {
        TargetResult {
            job_id: self.job_id,
            device_id: self.info.id.clone(),
            root_path: self.info.root_path.clone(),
            status: self.status(),
            bytes_planned: self.bytes_planned(),
            bytes_ok: self.bytes_ok(),
            bytes_failed: self.bytes_failed(),
            current_mbps: self.current_mbps(),
            max_mbps: self.max_mbps(),
            avg_mbps: self.avg_mbps(),
            queue_count: self.queue_count(),
            elapsed: self.elapsed(),
            eta: self.eta(),
            mini_simple_mode: mini.simple_mode,
            mini_opacity_percent: mini.opacity_percent,
            mini_dock_side: mini.dock_side.clone(),
            mini_top_margin: mini.top_margin_px,
        }
    }

    /// Buffer statistics sample; `None` before anything was planned.
    pub fn ram_stats(&self) -> Option<RamStats> {
        if self.bytes_planned() == 0 {
            return None;
        }
        Some(RamStats {
            job_id: self.job_id,
            device_id: self.info.id.clone(),
            bytes_buffered: self.buffered_bytes(),
            queue_depth: self.buffer_depth(),
            throughput_mbps: self.current_mbps(),
            ts: Utc::now(),
        })
    }

    /// Run the worker pool until the queue completes or `cancel` fires, then
    /// settle final status and byte totals.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn FileHandler>, cancel: CancellationToken) {
        let _ = self.started.set(Instant::now());
        self.set_status(JobStatus::Running);

        let mut workers = JoinSet::new();
        for _ in 0..self.worker_slots {
            let target = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            workers.spawn(async move { target.worker_loop(handler, cancel).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(device_id = %self.info.id, error = %err, "target worker ended abnormally");
            }
        }

        self.finish(cancel.is_cancelled());
        handler.report(&self);
    }

    async fn worker_loop(self: Arc<Self>, handler: Arc<dyn FileHandler>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let notified = self.work_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let file = match self.next_file() {
                Next::File(file) => file,
                Next::Done => {
                    self.work_ready.notify_waiters();
                    break;
                }
                Next::Wait => {
                    tokio::select! {
                        _ = &mut notified => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            };

            self.active_workers.fetch_add(1, Ordering::AcqRel);
            self.set_state(TransferState::Reading);
            let outcome = handler.copy_file(&self, &file, &cancel).await;
            self.active_workers.fetch_sub(1, Ordering::AcqRel);

            if outcome == FileOutcome::Abandoned {
                debug!(device_id = %self.info.id, path = %file.source_path.display(), "file abandoned");
                break;
            }
            self.record_result(outcome, file.size_bytes);
            if !cancel.is_cancelled() {
                handler.report(&self);
            }
        }
    }

    fn finish(&self, cancel_requested: bool) {
        // only a cancel that left files behind counts as canceled
        let canceled = {
            let mut queue = self.lock_queue();
            queue.completed = true;
            let canceled = cancel_requested && queue.pending > 0;
            if canceled {
                queue.files.clear();
            }
            canceled
        };

        let _ = self.finished_after.set(
            self.started
                .get()
                .map(Instant::elapsed)
                .unwrap_or(Duration::ZERO),
        );

        if canceled {
            let processed = self.bytes_ok() + self.bytes_failed();
            let unprocessed = self.bytes_planned().saturating_sub(processed);
            self.bytes_failed.fetch_add(unprocessed, Ordering::AcqRel);
            self.set_status(JobStatus::Canceled);
            self.set_state(TransferState::DoneError);
        } else if self.has_errors() {
            self.set_status(JobStatus::Error);
            self.set_state(TransferState::DoneError);
        } else {
            self.set_status(JobStatus::Completed);
            self.set_state(TransferState::DoneOk);
        }
    }
}
