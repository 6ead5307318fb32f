//! Engine-wide pause gate.
//!
//! Workers call `wait` before every read and write; while the gate is paused
//! they block without consuming CPU until it is resumed or the job's
//! cancellation token fires.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};

/// Shared pause flag. Cloning yields another handle to the same gate.
#[derive(Debug, Clone)]
pub struct PauseGate {
    paused: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    /// A gate that starts open.
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        PauseGate {
            paused: Arc::new(paused),
        }
    }

    pub fn pause(&self) {
        self.set_paused(true);
    }

    pub fn resume(&self) {
        self.set_paused(false);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Block while paused. Returns immediately when open.
    ///
    /// # Errors
    /// Returns `EngineError::Canceled` if `cancel` fires, paused or not.
    pub async fn wait(&self, cancel: &CancellationToken) -> EngineResult<()> {
        if cancel.is_cancelled() {
            return Err(EngineError::Canceled);
        }
        if !self.is_paused() {
            return Ok(());
        }

        let mut rx = self.paused.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Canceled),
            // the sender lives in `self`, so the channel cannot close here
            _ = rx.wait_for(|paused| !*paused) => Ok(()),
        }
    }
}
