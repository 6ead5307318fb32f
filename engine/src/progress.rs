//! Progress reporting.
//!
//! The engine publishes `EngineProgress` batches through the
//! `ProgressObserver` trait, which keeps the copy core decoupled from any UI
//! technology. Observers are invoked after every file completion and on the
//! periodic ticker while workers are active, from engine tasks, so they must
//! return quickly. `ChannelObserver` forwards batches to a dedicated
//! reporting task instead.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{TransferHealth, TransferState};

/// Immutable point-in-time view of one destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub device_id: String,
    pub label: String,
    pub file_system: String,
    pub bus_hint: String,
    pub current_mbps: f64,
    pub max_mbps: f64,
    pub avg_mbps: f64,
    /// Files not yet processed
    pub queue_count: usize,
    pub active_workers: usize,
    pub worker_slots: usize,
    /// Fraction of planned bytes copied successfully, 0.0..=1.0
    pub progress: f64,
    pub bytes_ok: u64,
    pub bytes_failed: u64,
    pub bytes_planned: u64,
    pub eta: Option<Duration>,
    pub state: TransferState,
    pub health: TransferHealth,
    /// Legacy bus with a non-empty queue
    pub queue_warning: bool,
}

/// One progress batch for a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineProgress {
    pub job_id: Uuid,
    pub targets: Vec<ProgressSnapshot>,
}

/// Receives progress batches from the engine.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &EngineProgress);
}

impl<F> ProgressObserver for F
where
    F: Fn(&EngineProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &EngineProgress) {
        self(progress)
    }
}

/// Observer that discards every batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_progress(&self, _progress: &EngineProgress) {}
}

/// Forwards batches over an unbounded channel to a reporting task.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<EngineProgress>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelObserver { tx }, rx)
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, progress: &EngineProgress) {
        // receiver gone means nobody is listening any more
        let _ = self.tx.send(progress.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn batch() -> EngineProgress {
        EngineProgress {
            job_id: Uuid::new_v4(),
            targets: Vec::new(),
        }
    }

    #[test]
    fn test_closure_observer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = {
            let calls = calls.clone();
            move |_: &EngineProgress| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        };
        observer.on_progress(&batch());
        observer.on_progress(&batch());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_channel_observer_forwards_batches() {
        let (observer, mut rx) = ChannelObserver::new();
        let sent = batch();
        observer.on_progress(&sent);
        let received = rx.recv().await.expect("batch forwarded");
        assert_eq!(received.job_id, sent.job_id);

        drop(rx);
        observer.on_progress(&batch());
    }
}
