//! Error types for the copy engine.
//!
//! `EngineError` covers both job-level failures (source missing, enumeration
//! failed) that prevent a job from starting, and per-file failures that the
//! worker boundary converts into item/error log records. Per-file errors never
//! propagate past a `TargetContext` worker.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the copy engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source directory does not exist
    #[error("source directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Source directory exists but cannot be read
    #[error("source directory access denied: {}", path.display())]
    SourceAccessDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A nested directory could not be enumerated
    #[error("failed to enumerate directory: {}", path.display())]
    EnumerationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to read from a source file
    #[error("failed to read file: {}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write to a destination file
    #[error("failed to write file: {}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create a destination directory
    #[error("failed to create directory: {}", path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Path is not usable for this operation
    #[error("invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// A job was started without any destination
    #[error("at least one destination is required")]
    NoDestinations,

    /// An exclusion pattern failed to compile
    #[error("invalid exclusion pattern '{pattern}'")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// Source and destination digests differ after copy
    #[error("verification failed, checksum mismatch: {}", path.display())]
    VerificationFailed { path: PathBuf },

    /// Encryption is enabled but no passphrase is unlocked
    #[error("encryption is enabled but no passphrase is unlocked")]
    EncryptionKeyUnavailable,

    /// Cipher setup, authentication, or stream framing failure
    #[error("crypto failure: {message}")]
    Crypto { message: String },

    /// The shared cancellation token fired
    #[error("operation canceled")]
    Canceled,

    /// A spawned task panicked or was aborted
    #[error("background task failed: {message}")]
    Task { message: String },
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::SourceAccessDenied { source, .. }
            | Self::EnumerationFailed { source, .. }
            | Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::DirectoryCreationFailed { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Short machine-friendly code stored on error log records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceNotFound { .. } => "SOURCE_NOT_FOUND",
            Self::SourceAccessDenied { .. } => "SOURCE_ACCESS_DENIED",
            Self::EnumerationFailed { .. } => "ENUMERATION_FAILED",
            Self::ReadError { .. } => "READ_ERROR",
            Self::WriteError { .. } => "WRITE_ERROR",
            Self::DirectoryCreationFailed { .. } => "DIRECTORY_CREATION_FAILED",
            Self::InvalidPath { .. } => "INVALID_PATH",
            Self::NoDestinations => "NO_DESTINATIONS",
            Self::InvalidPattern { .. } => "INVALID_PATTERN",
            // a digest mismatch is reported as an I/O failure
            Self::VerificationFailed { .. } => "IO_ERROR",
            Self::EncryptionKeyUnavailable => "ENCRYPTION_KEY_UNAVAILABLE",
            Self::Crypto { .. } => "CRYPTO_ERROR",
            Self::Canceled => "CANCELED",
            Self::Task { .. } => "TASK_FAILED",
        }
    }

    /// True when this error is the cooperative cancellation signal.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub(crate) fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::ReadError {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::WriteError {
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Task {
            message: err.to_string(),
        }
    }
}
