use std::fmt::Debug;
use std::sync::Arc;

use observability_deps::tracing::error;
use parking_lot::Mutex;
use rewind_id::TenantId;
use serde::Serialize;

/// Raised when a segment could not be archived after the configured number of attempts.
/// Archiving keeps retrying after the alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveAlert {
    pub tenant_id: TenantId,
    pub segment_name: Arc<str>,
    pub attempts: u32,
    pub last_error: String,
    pub first_failure_at_ns: i64,
}

/// Where operator alerts go
pub trait AlertSink: Debug + Send + Sync + 'static {
    fn alert(&self, alert: ArchiveAlert);
}

/// Logs alerts at `error` level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, alert: ArchiveAlert) {
        error!(
            tenant = %alert.tenant_id,
            segment = %alert.segment_name,
            attempts = alert.attempts,
            last_error = %alert.last_error,
            first_failure_at_ns = alert.first_failure_at_ns,
            "WAL segment archiving keeps failing, operator attention required"
        );
    }
}

/// Keeps every alert it receives
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<ArchiveAlert>>,
}

impl RecordingAlertSink {
    pub fn alerts(&self) -> Vec<ArchiveAlert> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn alert(&self, alert: ArchiveAlert) {
        self.alerts.lock().push(alert);
    }
}
