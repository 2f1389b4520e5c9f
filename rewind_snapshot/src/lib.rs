//! Snapshot creation, the pre-operation snapshot policy and retention.

pub mod engine;
pub mod manager;
pub mod retention;

use std::time::Duration;

pub use engine::{MemorySnapshotEngine, SnapshotEngine};
pub use manager::{PlannedAccess, SnapshotManager, SnapshotManagerArgs};
pub use retention::{
    RetentionScheduler, RetentionSchedulerArgs, SweepError, SweepReport, TenantSweep,
};

use rewind_catalog::TenantLockedError;
use rewind_id::{SnapshotId, TenantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("a snapshot of tenant {tenant_id} is already being created")]
    Busy { tenant_id: TenantId },

    #[error(transparent)]
    TenantLocked(#[from] TenantLockedError),

    #[error("snapshot {snapshot_id} of tenant {tenant_id} failed: {source}")]
    CreationFailed {
        tenant_id: TenantId,
        snapshot_id: SnapshotId,
        source: anyhow::Error,
    },

    #[error("reading the WAL position of tenant {tenant_id}: {source}")]
    WalPosition {
        tenant_id: TenantId,
        source: anyhow::Error,
    },

    #[error("snapshot {snapshot_id} not found for tenant {tenant_id}")]
    NotFound {
        tenant_id: TenantId,
        snapshot_id: SnapshotId,
    },

    #[error("releasing snapshot {snapshot_id} of tenant {tenant_id}: {source}")]
    Release {
        tenant_id: TenantId,
        snapshot_id: SnapshotId,
        source: anyhow::Error,
    },

    #[error("catalog error: {0}")]
    Catalog(#[from] rewind_catalog::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Writes touching more records than this always take a pre-operation snapshot
    pub bulk_threshold: usize,
    /// A session that took a snapshot more recently than this does not need another one for a
    /// small write
    #[serde(with = "humantime_serde")]
    pub session_snapshot_max_age: Duration,
    /// Sets the `expires_at` of new snapshots
    #[serde(with = "humantime_serde")]
    pub retention_window: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            bulk_threshold: 100,
            session_snapshot_max_age: Duration::from_secs(60 * 60),
            retention_window: 30 * DAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Default for tenants without their own window
    #[serde(with = "humantime_serde")]
    pub retention_window: Duration,
    /// The most recent ready snapshots of a tenant that are never expired
    pub min_preserved: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            retention_window: 30 * DAY,
            min_preserved: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_defaults() {
        let retention = RetentionConfig::default();
        assert_eq!(retention.retention_window, Duration::from_secs(30 * 86_400));
        assert_eq!(retention.min_preserved, 3);
        assert_eq!(SnapshotConfig::default().bulk_threshold, 100);
    }
}
