//! Persistence collaborator.
//!
//! The engine treats every call as best-effort: a failed write is logged and
//! the run continues.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{ErrorLog, ItemLog, Job, RamStats, TargetResult, ValidationLog};

#[async_trait]
pub trait Repository: Send + Sync {
    async fn upsert_job(&self, job: &Job) -> anyhow::Result<()>;

    async fn upsert_target(&self, target: &TargetResult) -> anyhow::Result<()>;

    async fn add_item_log(&self, log: ItemLog) -> anyhow::Result<()>;

    async fn add_error_log(&self, log: ErrorLog) -> anyhow::Result<()>;

    async fn add_validation_log(&self, log: ValidationLog) -> anyhow::Result<()>;

    async fn add_ram_stats(&self, stats: RamStats) -> anyhow::Result<()>;

    /// Stored exclusion patterns, merged with the settings list.
    async fn exclusion_patterns(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default)]
struct Records {
    jobs: HashMap<Uuid, Job>,
    targets: HashMap<(Uuid, String), TargetResult>,
    items: Vec<ItemLog>,
    errors: Vec<ErrorLog>,
    validations: Vec<ValidationLog>,
    ram_stats: Vec<RamStats>,
}

/// In-process repository; upserts keep the latest version of each record.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    records: Mutex<Records>,
    exclusions: Vec<String>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exclusions<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MemoryRepository {
            records: Mutex::default(),
            exclusions: patterns.into_iter().map(Into::into).collect(),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Records) -> T) -> T
    where
        T: Default,
    {
        self.records.lock().map(|r| f(&r)).unwrap_or_default()
    }

    fn write(&self, f: impl FnOnce(&mut Records)) -> anyhow::Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("repository lock poisoned"))?;
        f(&mut records);
        Ok(())
    }

    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.read(|r| r.jobs.get(&id).cloned())
    }

    pub fn target(&self, job_id: Uuid, device_id: &str) -> Option<TargetResult> {
        self.read(|r| r.targets.get(&(job_id, device_id.to_string())).cloned())
    }

    pub fn item_logs(&self) -> Vec<ItemLog> {
        self.read(|r| r.items.clone())
    }

    pub fn error_logs(&self) -> Vec<ErrorLog> {
        self.read(|r| r.errors.clone())
    }

    pub fn validation_logs(&self) -> Vec<ValidationLog> {
        self.read(|r| r.validations.clone())
    }

    pub fn ram_stats(&self) -> Vec<RamStats> {
        self.read(|r| r.ram_stats.clone())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn upsert_job(&self, job: &Job) -> anyhow::Result<()> {
        self.write(|r| {
            r.jobs.insert(job.id, job.clone());
        })
    }

    async fn upsert_target(&self, target: &TargetResult) -> anyhow::Result<()> {
        self.write(|r| {
            r.targets
                .insert((target.job_id, target.device_id.clone()), target.clone());
        })
    }

    async fn add_item_log(&self, log: ItemLog) -> anyhow::Result<()> {
        self.write(|r| r.items.push(log))
    }

    async fn add_error_log(&self, log: ErrorLog) -> anyhow::Result<()> {
        self.write(|r| r.errors.push(log))
    }

    async fn add_validation_log(&self, log: ValidationLog) -> anyhow::Result<()> {
        self.write(|r| r.validations.push(log))
    }

    async fn add_ram_stats(&self, stats: RamStats) -> anyhow::Result<()> {
        self.write(|r| r.ram_stats.push(stats))
    }

    async fn exclusion_patterns(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.exclusions.clone())
    }
}
