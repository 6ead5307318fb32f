//! Audit events and operator alerts.
//!
//! Audit events are fire-and-forget structured notifications (job start and
//! cancel, buffering mode, target failure, slow-bus warning, files added).
//! Alerts are raised once per target on its first failure.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::model::Severity;

/// Audit event types emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Transfer,
    BufferEnabled,
    BufferDisabled,
    TargetFailed,
    TargetSlowUsb2,
    FilesAddedToJob,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Transfer => "TRANSFER",
            EventKind::BufferEnabled => "BUFFER_ENABLED",
            EventKind::BufferDisabled => "BUFFER_DISABLED",
            EventKind::TargetFailed => "TARGET_FAILED",
            EventKind::TargetSlowUsb2 => "TARGET_SLOW_USB2",
            EventKind::FilesAddedToJob => "FILES_ADDED_TO_JOB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub kind: EventKind,
    pub message: String,
    pub severity: Severity,
    pub job_id: Option<Uuid>,
    pub device_id: Option<String>,
    pub ts: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: EventKind, message: impl Into<String>, severity: Severity) -> Self {
        AuditEvent {
            kind,
            message: message.into(),
            severity,
            job_id: None,
            device_id: None,
            ts: Utc::now(),
        }
    }

    pub fn for_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn for_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub message: String,
    pub severity: Severity,
    pub job_id: Option<Uuid>,
    pub device_id: Option<String>,
}

/// Fire-and-forget sink for audit events.
pub trait AuditSink: Send + Sync {
    fn record_event(&self, event: AuditEvent);
}

/// Sink for operator-facing alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise_alert(&self, alert: Alert) -> anyhow::Result<()>;
}

/// Emits audit events as tracing records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record_event(&self, event: AuditEvent) {
        let job_id = event.job_id.map(|id| id.to_string()).unwrap_or_default();
        let device_id = event.device_id.as_deref().unwrap_or_default();
        match event.severity {
            Severity::Info => info!(
                event = event.kind.as_str(),
                %job_id,
                device_id,
                "{}",
                event.message
            ),
            Severity::Warn => warn!(
                event = event.kind.as_str(),
                %job_id,
                device_id,
                "{}",
                event.message
            ),
            Severity::Critical => error!(
                event = event.kind.as_str(),
                %job_id,
                device_id,
                "{}",
                event.message
            ),
        }
    }
}

/// Emits alerts as tracing records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise_alert(&self, alert: Alert) -> anyhow::Result<()> {
        error!(
            severity = alert.severity.as_str(),
            job_id = ?alert.job_id,
            device_id = alert.device_id.as_deref().unwrap_or_default(),
            "ALERT: {}",
            alert.message
        );
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record_event(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Keeps every alert in memory.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .map(|alerts| alerts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn raise_alert(&self, alert: Alert) -> anyhow::Result<()> {
        self.alerts
            .lock()
            .map_err(|_| anyhow::anyhow!("alert store poisoned"))?
            .push(alert);
        Ok(())
    }
}
