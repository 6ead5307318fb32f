//! # MultiCopy Engine - Multi-Destination Copy Library
//!
//! A headless engine that copies one source directory tree to several
//! destinations at once. Designed as the foundation for multiple front ends
//! (CLI, service, automation).
//!
//! ## Overview
//!
//! - Recursive source enumeration with glob-style exclusions
//! - One independent worker pool per destination; a failing destination never
//!   stalls the others
//! - Buffered (bounded reader/writer pipeline) or direct copy, SHA-256
//!   verification, optional AES-256-GCM encryption to `.enc` files
//! - Global pause/resume, cooperative cancellation, files added to a running job
//! - Progress snapshots, audit events, alerts and persistence through
//!   pluggable collaborators
//! - Pre-flight destination checks (free space, FAT file-size limit, USB 2.0)
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use multicopy_engine::{
//!     DestinationInfo, Engine, EngineParts, EngineSettings, Job, StaticSettings,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(EngineParts::new(Arc::new(StaticSettings::new(
//!     EngineSettings::default(),
//! ))));
//!
//! let handle = engine
//!     .start_job(
//!         Job::new("/data/photos"),
//!         vec![
//!             DestinationInfo::folder("usb-a", "/media/usb-a"),
//!             DestinationInfo::folder("usb-b", "/media/usb-b"),
//!         ],
//!         CancellationToken::new(),
//!     )
//!     .await?;
//!
//! let job = handle.wait().await?;
//! for target in &job.targets {
//!     println!("{}: {} ({} bytes ok)", target.device_id, target.status, target.bytes_ok);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Jobs, files, destinations and log records
//! - **settings**: Settings snapshot and its provider trait
//! - **error**: Error types and codes
//! - **exclusions**: Wildcard exclusion patterns
//! - **fs_ops**: Source enumeration and destination path helpers
//! - **pause**: Global pause gate
//! - **pipeline**: Buffered, direct and encrypted single-file copies
//! - **encryptor**: Streaming AES-256-GCM file format
//! - **verifier**: SHA-256 comparison of source and destination
//! - **target**: Per-destination queue, counters and worker pool
//! - **engine**: Job orchestration
//! - **progress**: Progress snapshots and observers
//! - **audit**: Audit events and alerts
//! - **repository**: Persistence collaborator
//! - **precheck**: Pre-flight destination validation

pub mod audit;
pub mod encryptor;
pub mod engine;
pub mod error;
pub mod exclusions;
pub mod fs_ops;
pub mod model;
pub mod pause;
pub mod pipeline;
pub mod precheck;
pub mod progress;
pub mod repository;
pub mod settings;
pub mod target;
pub mod verifier;

// Re-export main types and functions
pub use audit::{
    Alert, AlertSink, AuditEvent, AuditSink, EventKind, MemoryAlertSink, MemoryAuditSink,
    TracingAlertSink, TracingAuditSink,
};
pub use engine::{AddFilesResult, Engine, EngineParts, JobHandle};
pub use error::{EngineError, EngineResult};
pub use exclusions::ExclusionSet;
pub use model::{
    DestinationInfo, ErrorLog, ItemAction, ItemLog, ItemStatus, Job, JobStatus, RamStats,
    Severity, SourceFile, TargetFile, TargetResult, TransferHealth, TransferState, ValidationLog,
};
pub use precheck::{
    evaluate, format_bytes, DestinationProbe, PrecheckFinding, PrecheckLevel, PrecheckReport,
    SourceMetadata,
};
pub use progress::{ChannelObserver, EngineProgress, NullObserver, ProgressObserver, ProgressSnapshot};
pub use repository::{MemoryRepository, Repository};
pub use settings::{
    BufferSettings, EncryptionSettings, EngineSettings, MiniWindowSettings, PerformanceSettings,
    SettingsProvider, StaticSettings,
};
