//! Pre-flight destination validation.
//!
//! `evaluate` is a pure function over the source metadata and whatever the
//! device-enumeration collaborator returned for each selected destination.
//! Deciding whether a failure blocks the job, and persisting the findings,
//! is left to the caller.

use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::model::{DestinationInfo, SourceFile, ValidationLog};

/// Largest single file a FAT-family filesystem can hold.
pub const FAT_FILE_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

const FAT_FILESYSTEMS: &[&str] = &["FAT", "FAT16", "FAT32"];

/// Summary of the gathered source tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceMetadata {
    pub file_count: usize,
    pub total_bytes: u64,
    pub largest_file_bytes: u64,
}

impl SourceMetadata {
    pub fn from_files(files: &[SourceFile]) -> Self {
        SourceMetadata {
            file_count: files.len(),
            total_bytes: files.iter().map(|f| f.size_bytes).sum(),
            largest_file_bytes: files.iter().map(|f| f.size_bytes).max().unwrap_or(0),
        }
    }

    pub fn has_file_over_fat_limit(&self) -> bool {
        self.largest_file_bytes > FAT_FILE_LIMIT
    }
}

/// A destination the operator selected; `info` is `None` when the device
/// could not be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationProbe {
    pub label: String,
    pub info: Option<DestinationInfo>,
}

impl DestinationProbe {
    pub fn available(info: DestinationInfo) -> Self {
        DestinationProbe {
            label: info.display_label(),
            info: Some(info),
        }
    }

    pub fn unavailable(label: impl Into<String>) -> Self {
        DestinationProbe {
            label: label.into(),
            info: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum PrecheckLevel {
    Pass,
    Warn,
    Fail,
}

impl PrecheckLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PrecheckLevel::Pass => "PASS",
            PrecheckLevel::Warn => "WARN",
            PrecheckLevel::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrecheckFinding {
    pub label: String,
    pub message: String,
    pub level: PrecheckLevel,
}

impl PrecheckFinding {
    fn new(label: impl Into<String>, message: impl Into<String>, level: PrecheckLevel) -> Self {
        PrecheckFinding {
            label: label.into(),
            message: message.into(),
            level,
        }
    }

    /// Record a caller can persist through the repository.
    pub fn to_validation_log(&self, job_id: Uuid) -> ValidationLog {
        ValidationLog {
            job_id,
            rule: "PRECHECK".to_string(),
            result: self.level.as_str().to_string(),
            details: format!("{}: {}", self.label, self.message),
            ts: Utc::now(),
        }
    }
}

/// Ordered findings of one precheck run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrecheckReport {
    pub findings: Vec<PrecheckFinding>,
}

impl PrecheckReport {
    fn count(&self, level: PrecheckLevel) -> usize {
        self.findings.iter().filter(|f| f.level == level).count()
    }

    pub fn pass_count(&self) -> usize {
        self.count(PrecheckLevel::Pass)
    }

    pub fn warn_count(&self) -> usize {
        self.count(PrecheckLevel::Warn)
    }

    pub fn fail_count(&self) -> usize {
        self.count(PrecheckLevel::Fail)
    }

    pub fn summary(&self) -> String {
        format!(
            "Precheck: PASS {} / WARN {} / FAIL {}",
            self.pass_count(),
            self.warn_count(),
            self.fail_count()
        )
    }

    /// Failures block the job unless the caller forces it.
    pub fn blocks_start(&self, force: bool) -> bool {
        self.fail_count() > 0 && !force
    }
}

/// Run every check against every destination.
pub fn evaluate(
    source_root: &Path,
    source: &SourceMetadata,
    destinations: &[DestinationProbe],
) -> PrecheckReport {
    let mut findings = Vec::with_capacity(1 + destinations.len() * 3);

    let source_label = source_label(source_root);
    findings.push(if source.total_bytes > 0 {
        PrecheckFinding::new(
            &source_label,
            format!(
                "Source readable: {} files, {}",
                source.file_count,
                format_bytes(source.total_bytes)
            ),
            PrecheckLevel::Pass,
        )
    } else {
        PrecheckFinding::new(&source_label, "Source has no files", PrecheckLevel::Fail)
    });

    for probe in destinations {
        let Some(info) = &probe.info else {
            findings.push(PrecheckFinding::new(
                &probe.label,
                "Device not available",
                PrecheckLevel::Fail,
            ));
            continue;
        };
        let label = info.display_label();

        let space = format!(
            "Free space {} / required {}",
            format_bytes(info.free_bytes),
            format_bytes(source.total_bytes)
        );
        findings.push(if info.free_bytes >= source.total_bytes {
            PrecheckFinding::new(&label, space, PrecheckLevel::Pass)
        } else {
            PrecheckFinding::new(&label, space, PrecheckLevel::Fail)
        });

        let fat = FAT_FILESYSTEMS
            .iter()
            .any(|fs| info.file_system.eq_ignore_ascii_case(fs));
        findings.push(if fat && source.has_file_over_fat_limit() {
            PrecheckFinding::new(
                &label,
                format!("{} cannot hold files over 4 GiB", info.file_system),
                PrecheckLevel::Warn,
            )
        } else {
            PrecheckFinding::new(&label, "File size limit OK", PrecheckLevel::Pass)
        });

        findings.push(if info.is_legacy_bus() {
            PrecheckFinding::new(
                &label,
                "USB 2.0 port detected; reduced speed",
                PrecheckLevel::Warn,
            )
        } else {
            PrecheckFinding::new(&label, "Bus speed OK", PrecheckLevel::Pass)
        });
    }

    PrecheckReport { findings }
}

fn source_label(root: &Path) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| root.display().to_string())
}

/// Human-readable byte count, binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}
