//! Engine settings and the provider trait that supplies them.
//!
//! Settings are read once per job (and once per late file addition) and
//! treated as a read-only snapshot for that operation.

use serde::{Deserialize, Serialize};

/// Smallest chunk the buffered pipeline will use.
pub const MIN_CHUNK_SIZE: usize = 1024 * 1024;

/// Buffered read/write pipeline parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    pub enabled: bool,
    pub chunk_size_mb: usize,
    pub max_chunks: usize,
    pub writer_workers_per_target: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        BufferSettings {
            enabled: true,
            chunk_size_mb: 4,
            max_chunks: 32,
            writer_workers_per_target: 1,
        }
    }
}

impl BufferSettings {
    /// Chunk size in bytes, never below 1 MiB.
    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_size_mb
            .saturating_mul(1024 * 1024)
            .max(MIN_CHUNK_SIZE)
    }

    /// Bounded queue capacity, never below 1.
    pub fn queue_capacity(&self) -> usize {
        self.max_chunks.max(1)
    }

    /// Worker tasks per destination, never below 1.
    pub fn worker_slots(&self) -> usize {
        self.writer_workers_per_target.max(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionSettings {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    /// Advisory only; every destination runs concurrently.
    pub max_parallel_targets: usize,
    /// Period of the progress ticker while workers are active.
    pub progress_interval_ms: u64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        PerformanceSettings {
            max_parallel_targets: 3,
            progress_interval_ms: 1000,
        }
    }
}

/// Mini transfer window preferences carried onto persisted target results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiniWindowSettings {
    pub simple_mode: bool,
    pub opacity_percent: u8,
    pub dock_side: String,
    pub top_margin_px: u32,
}

impl Default for MiniWindowSettings {
    fn default() -> Self {
        MiniWindowSettings {
            simple_mode: false,
            opacity_percent: 90,
            dock_side: "Left".to_string(),
            top_margin_px: 80,
        }
    }
}

/// Complete settings snapshot used by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub buffer: BufferSettings,
    pub encryption: EncryptionSettings,
    pub performance: PerformanceSettings,
    pub mini_window: MiniWindowSettings,
    /// Glob-style exclusion patterns, merged with the repository's list
    pub exclusions: Vec<String>,
}

/// Supplies settings and the unlocked encryption passphrase.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> EngineSettings;

    /// Passphrase unlocked by a privileged operator, if any.
    fn unlocked_passphrase(&self) -> Option<String>;
}

/// Fixed settings, e.g. loaded once from a config file.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    pub settings: EngineSettings,
    pub passphrase: Option<String>,
}

impl StaticSettings {
    pub fn new(settings: EngineSettings) -> Self {
        StaticSettings {
            settings,
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

impl SettingsProvider for StaticSettings {
    fn settings(&self) -> EngineSettings {
        self.settings.clone()
    }

    fn unlocked_passphrase(&self) -> Option<String> {
        self.passphrase.clone()
    }
}
