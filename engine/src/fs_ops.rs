//! Filesystem operations module.
//!
//! This module provides the synchronous filesystem helpers the engine runs on
//! blocking threads:
//! - Enumerating the source tree with exclusion filtering
//! - Expanding late-added paths against the job root
//! - Resolving destination paths and creating parent directories
//! - Preserving modification times after a copy

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::exclusions::ExclusionSet;
use crate::model::SourceFile;

/// Suffix appended to destination files when encryption is enabled.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

/// Files kept by a scan, plus the relative paths dropped by exclusions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatherOutcome {
    pub files: Vec<SourceFile>,
    pub skipped: Vec<PathBuf>,
}

impl GatherOutcome {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

/// Recursively enumerate every file under `root`, skipping excluded entries.
///
/// # Errors
/// Returns `SourceNotFound` / `SourceAccessDenied` / `InvalidPath` for an
/// unusable root and `EnumerationFailed` when a nested directory cannot be read.
pub fn gather_files(root: &Path, exclusions: &ExclusionSet) -> EngineResult<GatherOutcome> {
    validate_source_root(root)?;

    let mut paths = Vec::new();
    walk_files(root, &mut paths).map_err(|err| match err {
        EngineError::EnumerationFailed { path, source } if path == root => {
            EngineError::SourceAccessDenied { path, source }
        }
        other => other,
    })?;

    let mut outcome = GatherOutcome::default();
    for path in paths {
        let relative = match path.strip_prefix(root) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => continue,
        };
        push_file(&mut outcome, path, relative, exclusions)?;
    }

    Ok(outcome)
}

/// Expand user-supplied paths for a job that is already running.
///
/// Directories are expanded recursively, every path is canonicalised and
/// deduplicated, and anything outside `root` or missing is dropped. Exclusion
/// filtering matches `gather_files`.
pub fn expand_paths(
    root: &Path,
    paths: &[PathBuf],
    exclusions: &ExclusionSet,
) -> EngineResult<GatherOutcome> {
    let root = root.canonicalize().map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => EngineError::SourceNotFound {
            path: root.to_path_buf(),
        },
        _ => EngineError::SourceAccessDenied {
            path: root.to_path_buf(),
            source,
        },
    })?;

    let mut candidates = Vec::new();
    for path in paths {
        if path.as_os_str().is_empty() {
            continue;
        }
        match fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => walk_files(path, &mut candidates)?,
            Ok(metadata) if metadata.is_file() => candidates.push(path.clone()),
            Ok(_) => {}
            Err(err) => debug!(path = %path.display(), error = %err, "ignoring unreadable path"),
        }
    }

    let mut seen = HashSet::new();
    let mut outcome = GatherOutcome::default();
    for path in candidates {
        let canonical = match path.canonicalize() {
            Ok(canonical) => canonical,
            Err(_) => continue,
        };
        if !seen.insert(canonical.clone()) {
            continue;
        }
        let relative = match canonical.strip_prefix(&root) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => {
                debug!(path = %canonical.display(), "rejecting path outside source root");
                continue;
            }
        };
        push_file(&mut outcome, canonical, relative, exclusions)?;
    }

    Ok(outcome)
}

fn validate_source_root(root: &Path) -> EngineResult<()> {
    match fs::metadata(root) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::InvalidPath {
            path: root.to_path_buf(),
            reason: "source must be a directory".to_string(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(EngineError::SourceNotFound {
            path: root.to_path_buf(),
        }),
        Err(e) => Err(EngineError::SourceAccessDenied {
            path: root.to_path_buf(),
            source: e,
        }),
    }
}

fn push_file(
    outcome: &mut GatherOutcome,
    path: PathBuf,
    relative: PathBuf,
    exclusions: &ExclusionSet,
) -> EngineResult<()> {
    if exclusions.is_excluded(&relative) {
        outcome.skipped.push(relative);
        return Ok(());
    }

    let metadata = fs::metadata(&path).map_err(|source| EngineError::read(&path, source))?;
    outcome.files.push(SourceFile {
        source_path: path,
        relative_path: relative,
        size_bytes: metadata.len(),
    });
    Ok(())
}

/// Collect regular files below `dir` in name order. Symlinks to files are
/// followed; symlinked directories are not descended.
fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> EngineResult<()> {
    let enumeration_failed = |source| EngineError::EnumerationFailed {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = fs::read_dir(dir)
        .map_err(enumeration_failed)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(enumeration_failed)?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type().map_err(enumeration_failed)?;

        if file_type.is_dir() {
            walk_files(&path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        } else if file_type.is_symlink() {
            match fs::metadata(&path) {
                Ok(target) if target.is_file() => out.push(path),
                Ok(_) => debug!(path = %path.display(), "not following directory symlink"),
                Err(err) => debug!(path = %path.display(), error = %err, "skipping broken symlink"),
            }
        }
    }

    Ok(())
}

/// Resolve a relative source path against a destination root.
pub fn destination_path(root: &Path, relative: &Path, encrypted: bool) -> PathBuf {
    let path = root.join(relative);
    if encrypted {
        let mut raw = path.into_os_string();
        raw.push(ENCRYPTED_SUFFIX);
        PathBuf::from(raw)
    } else {
        path
    }
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns `DirectoryCreationFailed` if the parent cannot be created or
/// exists as something other than a directory.
pub fn ensure_parent_dir_exists(path: &Path) -> EngineResult<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}

/// Copy the source modification time onto the destination. Best-effort.
pub fn preserve_modified_time(src: &Path, dst: &Path) {
    let mtime = match fs::metadata(src).and_then(|m| m.modified()) {
        Ok(mtime) => mtime,
        Err(_) => return,
    };
    if let Err(err) = filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime)) {
        debug!(path = %dst.display(), error = %err, "could not preserve modification time");
    }
}
