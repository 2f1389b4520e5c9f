//! Bringing a tenant back to a snapshot or a point in time.
//!
//! A restore claims the tenant exclusively, waits for in-flight operations to finish, flags the
//! tenant as under maintenance and hands a [`RestorePlan`] to the [`RestoreEngine`]. Every attempt
//! is recorded as a restore event in the catalog.

pub mod engine;
pub mod orchestrator;

use std::time::Duration;

pub use engine::{MemoryRestoreEngine, RestoreEngine, RestorePlan};
pub use orchestrator::{RestoreOrchestrator, RestoreOrchestratorArgs, RestoreStatus};

use iox_time::Time;
use rewind_catalog::{SnapshotState, TenantDirectoryError, TenantLockedError};
use rewind_id::{RestoreEventId, SnapshotId, TenantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    TenantLocked(#[from] TenantLockedError),

    #[error("snapshot {snapshot_id} not found for tenant {tenant_id}")]
    SnapshotNotFound {
        tenant_id: TenantId,
        snapshot_id: SnapshotId,
    },

    #[error("snapshot {snapshot_id} of tenant {tenant_id} is {} and cannot be restored", state.as_str())]
    SnapshotNotRestorable {
        tenant_id: TenantId,
        snapshot_id: SnapshotId,
        state: SnapshotState,
    },

    #[error("{requested} is outside the restorable range of tenant {tenant_id}, the earliest restorable time is {earliest}")]
    OutOfRange {
        tenant_id: TenantId,
        requested: Time,
        earliest: Time,
    },

    #[error("tenant {tenant_id} has no ready snapshot to restore from")]
    NothingRestorable { tenant_id: TenantId },

    #[error("cannot restore tenant {tenant_id} to {requested}, which is after the current time {now}")]
    TargetInFuture {
        tenant_id: TenantId,
        requested: Time,
        now: Time,
    },

    #[error("restore {event_id} of tenant {tenant_id} failed: {source}")]
    Failed {
        tenant_id: TenantId,
        event_id: RestoreEventId,
        source: anyhow::Error,
    },

    #[error("restore {event_id} of tenant {tenant_id} did not finish within {}", humantime::format_duration(*max_duration))]
    TimedOut {
        tenant_id: TenantId,
        event_id: RestoreEventId,
        max_duration: Duration,
    },

    #[error("tenant directory error: {0}")]
    Directory(#[from] TenantDirectoryError),

    #[error("catalog error: {0}")]
    Catalog(#[from] rewind_catalog::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// A restore still running after this long is abandoned and the tenant is left failed
    #[serde(with = "humantime_serde")]
    pub max_duration: Duration,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(4 * 60 * 60),
        }
    }
}
