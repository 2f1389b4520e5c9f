//! The recovery catalog: a strongly-typed, tenant-scoped record of every snapshot, archived WAL
//! segment and restore event, together with the per-tenant locks that keep restores exclusive.
//!
//! Nothing in here is shared between tenants apart from the registries that hand out each
//! tenant's state; all mutation happens behind the owning tenant's lock.

pub mod catalog;
pub mod lock;
pub mod object_store;
pub mod paths;
pub mod serialize;
pub mod tenant;

pub use catalog::{
    Catalog, RestoreEvent, RestoreOutcome, RestoreTarget, Snapshot, SnapshotFilter, SnapshotState,
    SnapshotType, TenantCatalog, TenantUsage, WalSegmentRecord,
};
pub use lock::{ExclusiveClaim, SharedAccess, TenantLockManager, TenantLockState, TenantLockedError};
pub use tenant::{
    ConnectionDescriptor, InMemoryTenantDirectory, MaintenanceIndicator, Tenant, TenantDirectory,
    TenantDirectoryError,
};

use rewind_id::{RestoreEventId, SnapshotId, TenantId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("snapshot {snapshot_id} not found for tenant {tenant_id}")]
    SnapshotNotFound {
        tenant_id: TenantId,
        snapshot_id: SnapshotId,
    },

    #[error("snapshot {snapshot_id} cannot move from {from} to {to}")]
    InvalidTransition {
        snapshot_id: SnapshotId,
        from: SnapshotState,
        to: SnapshotState,
    },

    #[error("snapshot {snapshot_id} is already being created for tenant {tenant_id}")]
    SnapshotInFlight {
        tenant_id: TenantId,
        snapshot_id: SnapshotId,
    },

    #[error("restore event {event_id} not found for tenant {tenant_id}")]
    RestoreEventNotFound {
        tenant_id: TenantId,
        event_id: RestoreEventId,
    },

    #[error("object store error: {0}")]
    ObjectStore(#[from] ::object_store::Error),

    #[error("invalid catalog checkpoint: {0}")]
    Checkpoint(#[from] serialize::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
