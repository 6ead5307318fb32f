//! Core data model for multi-destination copy jobs.
//!
//! - `Job`: one copy request fanned out to N destinations
//! - `SourceFile` / `TargetFile`: a discovered file, and the same file resolved
//!   against one destination root
//! - `DestinationInfo`: destination metadata supplied by device enumeration
//! - `TargetResult`: the persisted view of one destination's run
//! - log records handed to the `Repository`

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a job, and of each destination within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Canceled,
    Error,
}

impl JobStatus {
    const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Canceled,
        JobStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Paused => "Paused",
            JobStatus::Completed => "Completed",
            JobStatus::Canceled => "Canceled",
            JobStatus::Error => "Error",
        }
    }

    /// Returns true if no further transitions are expected.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Canceled | JobStatus::Error
        )
    }

    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        Self::ALL
            .get(raw as usize)
            .copied()
            .unwrap_or(JobStatus::Pending)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A copy job: one source tree, many destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job
    pub id: Uuid,

    /// Root source directory
    pub source_root: PathBuf,

    /// Free-form operator name carried to persistence
    pub operator_name: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    pub status: JobStatus,

    /// Sum of planned bytes across all destinations
    pub bytes_planned: u64,
    pub bytes_ok: u64,
    pub bytes_failed: u64,

    /// Per-destination results, filled when the job finishes
    pub targets: Vec<TargetResult>,
}

impl Job {
    /// Create a pending job for a source root.
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Job {
            id: Uuid::new_v4(),
            source_root: source_root.into(),
            operator_name: None,
            started_at: None,
            ended_at: None,
            status: JobStatus::Pending,
            bytes_planned: 0,
            bytes_ok: 0,
            bytes_failed: 0,
            targets: Vec::new(),
        }
    }
}

/// A file discovered under the job's source root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceFile {
    pub source_path: PathBuf,
    /// Path relative to the job root
    pub relative_path: PathBuf,
    pub size_bytes: u64,
}

/// A source file resolved against one destination root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFile {
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub relative_path: PathBuf,
    pub size_bytes: u64,
}

impl TargetFile {
    /// Source extension with a leading dot and its case kept, or empty.
    pub fn extension(&self) -> String {
        self.source_path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default()
    }
}

/// Destination metadata supplied by the device-enumeration collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationInfo {
    /// Stable device identifier
    pub id: String,
    /// Directory that receives the copy
    pub root_path: PathBuf,
    /// Volume label, may be empty
    pub label: String,
    /// Filesystem name, e.g. "NTFS", "FAT32", "ext4"
    pub file_system: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    /// Bus hint, e.g. "USB 3.0", "USB 2.0", "SATA/NVMe", "Unknown"
    pub bus_hint: String,
}

impl DestinationInfo {
    /// Minimal destination with unknown capacity; handy for tests and ad-hoc folders.
    pub fn folder(id: impl Into<String>, root_path: impl Into<PathBuf>) -> Self {
        DestinationInfo {
            id: id.into(),
            root_path: root_path.into(),
            label: String::new(),
            file_system: String::new(),
            total_bytes: 0,
            free_bytes: u64::MAX,
            bus_hint: "Unknown".to_string(),
        }
    }

    /// Label used in UI-facing text: the volume label, else the root path.
    pub fn display_label(&self) -> String {
        if self.label.trim().is_empty() {
            self.root_path.display().to_string()
        } else {
            self.label.clone()
        }
    }

    pub fn is_legacy_bus(&self) -> bool {
        is_legacy_bus(&self.bus_hint)
    }
}

/// True when a bus hint denotes a legacy low-speed interface (USB 2).
pub fn is_legacy_bus(bus_hint: &str) -> bool {
    bus_hint.to_ascii_lowercase().contains("usb 2")
}

/// Persisted view of one destination's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    pub job_id: Uuid,
    pub device_id: String,
    pub root_path: PathBuf,
    pub status: JobStatus,
    pub bytes_planned: u64,
    pub bytes_ok: u64,
    pub bytes_failed: u64,
    pub current_mbps: f64,
    pub max_mbps: f64,
    pub avg_mbps: f64,
    pub queue_count: usize,
    pub elapsed: Duration,
    pub eta: Option<Duration>,

    // UI preferences owned by the settings collaborator; carried through only
    pub mini_simple_mode: bool,
    pub mini_opacity_percent: u8,
    pub mini_dock_side: String,
    pub mini_top_margin: u32,
}

/// Per-destination lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Idle,
    Reading,
    Writing,
    Encrypting,
    Verifying,
    BufferWait,
    Paused,
    DoneOk,
    DoneError,
}

impl TransferState {
    const ALL: [TransferState; 9] = [
        TransferState::Idle,
        TransferState::Reading,
        TransferState::Writing,
        TransferState::Encrypting,
        TransferState::Verifying,
        TransferState::BufferWait,
        TransferState::Paused,
        TransferState::DoneOk,
        TransferState::DoneError,
    ];

    /// UI label for this state.
    pub fn label(self) -> &'static str {
        match self {
            TransferState::Idle => "Idle",
            TransferState::Reading => "Reading",
            TransferState::Writing => "Writing",
            TransferState::Encrypting => "Encrypting",
            TransferState::Verifying => "Verifying",
            TransferState::BufferWait => "Buffer wait",
            TransferState::Paused => "Paused",
            TransferState::DoneOk => "Done",
            TransferState::DoneError => "Done with errors",
        }
    }

    /// States in which a worker is actively moving bytes.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TransferState::Reading
                | TransferState::Writing
                | TransferState::Encrypting
                | TransferState::Verifying
                | TransferState::BufferWait
        )
    }

    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        Self::ALL
            .get(raw as usize)
            .copied()
            .unwrap_or(TransferState::Idle)
    }
}

/// Derived UI-facing health, distinct from the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferHealth {
    Ok,
    Warn,
    Critical,
}

impl TransferHealth {
    pub fn severity(self) -> Severity {
        match self {
            TransferHealth::Ok => Severity::Info,
            TransferHealth::Warn => Severity::Warn,
            TransferHealth::Critical => Severity::Critical,
        }
    }
}

/// Severity shared by audit events and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// Outcome status stored on an item log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Ok,
    Failed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Ok => "OK",
            ItemStatus::Failed => "FAILED",
        }
    }
}

/// Action recorded on an item log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemAction {
    Copy,
    Encrypt,
}

impl ItemAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemAction::Copy => "COPY",
            ItemAction::Encrypt => "ENCRYPT",
        }
    }
}

/// One file processed on one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemLog {
    pub job_id: Uuid,
    pub device_id: String,
    pub action: ItemAction,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub size_bytes: u64,
    pub extension: String,
    pub status: ItemStatus,
    pub ts: DateTime<Utc>,
}

/// A per-file failure on one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLog {
    pub job_id: Uuid,
    pub device_id: String,
    pub file_path: PathBuf,
    pub error_code: String,
    pub os_error: Option<i32>,
    pub message: String,
    pub ts: DateTime<Utc>,
}

/// A validation record: exclusion skips and precheck findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationLog {
    pub job_id: Uuid,
    pub rule: String,
    pub result: String,
    pub details: String,
    pub ts: DateTime<Utc>,
}

impl ValidationLog {
    pub(crate) fn skipped(job_id: Uuid, relative: &Path) -> Self {
        ValidationLog {
            job_id,
            rule: "Exclusion".to_string(),
            result: "SKIPPED".to_string(),
            details: relative.display().to_string(),
            ts: Utc::now(),
        }
    }
}

/// In-memory buffering statistics sampled while a destination runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RamStats {
    pub job_id: Uuid,
    pub device_id: String,
    pub bytes_buffered: i64,
    pub queue_depth: i64,
    pub throughput_mbps: f64,
    pub ts: DateTime<Utc>,
}
