use std::sync::Arc;

use dashmap::DashMap;
use iox_time::TimeProvider;
use observability_deps::tracing::{debug, error, info, warn};
use rewind_catalog::{
    Catalog, SharedAccess, Snapshot, SnapshotFilter, SnapshotState, SnapshotType,
    TenantLockManager,
};
use rewind_id::{Lsn, SessionId, SnapshotId, TenantId};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{Error, Result, SnapshotConfig, engine::SnapshotEngine};

/// What the mutation layer is about to do on behalf of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAccess {
    Read,
    Write { record_count: usize },
}

#[derive(Debug, Default)]
struct TenantGates {
    /// Held for the whole of a snapshot creation
    creation: Arc<Mutex<()>>,
    /// Serialises catalog changes of snapshot creation with the retention sweep
    operations: Arc<Mutex<()>>,
}

#[derive(Debug)]
pub struct SnapshotManagerArgs {
    pub catalog: Arc<Catalog>,
    pub engine: Arc<dyn SnapshotEngine>,
    pub locks: Arc<TenantLockManager>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub config: SnapshotConfig,
}

#[derive(Debug)]
pub struct SnapshotManager {
    catalog: Arc<Catalog>,
    engine: Arc<dyn SnapshotEngine>,
    locks: Arc<TenantLockManager>,
    time_provider: Arc<dyn TimeProvider>,
    config: SnapshotConfig,
    gates: DashMap<TenantId, Arc<TenantGates>>,
}

impl SnapshotManager {
    pub fn new(
        SnapshotManagerArgs {
            catalog,
            engine,
            locks,
            time_provider,
            config,
        }: SnapshotManagerArgs,
    ) -> Self {
        Self {
            catalog,
            engine,
            locks,
            time_provider,
            config,
            gates: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub(crate) fn locks(&self) -> &TenantLockManager {
        &self.locks
    }

    fn gates(&self, tenant_id: &TenantId) -> Arc<TenantGates> {
        Arc::clone(self.gates.entry(tenant_id.clone()).or_default().value())
    }

    /// Exclusive use of the tenant's catalog for snapshot bookkeeping
    pub(crate) async fn lock_operations(&self, tenant_id: &TenantId) -> OwnedMutexGuard<()> {
        Arc::clone(&self.gates(tenant_id).operations)
            .lock_owned()
            .await
    }

    /// Take a snapshot of the tenant.
    ///
    /// Fails with [`Error::Busy`] if a snapshot of the tenant is already being created, and with
    /// [`Error::CreationFailed`] if the engine could not take it, in which case the snapshot is left
    /// `failed` in the catalog.
    pub async fn create_snapshot(
        &self,
        tenant_id: &TenantId,
        snapshot_type: SnapshotType,
        label: Option<String>,
    ) -> Result<Snapshot> {
        self.create(tenant_id, snapshot_type, label, None).await
    }

    async fn create(
        &self,
        tenant_id: &TenantId,
        snapshot_type: SnapshotType,
        label: Option<String>,
        session_id: Option<SessionId>,
    ) -> Result<Snapshot> {
        let access = self.locks.shared(tenant_id)?;
        let gates = self.gates(tenant_id);
        let Ok(creating) = Arc::clone(&gates.creation).try_lock_owned() else {
            return Err(Error::Busy {
                tenant_id: tenant_id.clone(),
            });
        };

        let lsn = self
            .engine
            .current_lsn(tenant_id)
            .await
            .map_err(|source| Error::WalPosition {
                tenant_id: tenant_id.clone(),
                source,
            })?;
        let catalog = self.catalog.tenant(tenant_id);
        let snapshot = {
            let _ops = gates.operations.lock().await;
            let now = self.time_provider.now();
            match catalog.begin_snapshot(
                snapshot_type,
                label,
                session_id,
                lsn,
                now,
                now.checked_add(self.config.retention_window),
            ) {
                Ok(snapshot) => snapshot,
                Err(rewind_catalog::Error::SnapshotInFlight { .. }) => {
                    return Err(Error::Busy {
                        tenant_id: tenant_id.clone(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        };
        info!(
            tenant = %tenant_id,
            snapshot_id = %snapshot.id,
            snapshot_type = %snapshot_type,
            %lsn,
            "creating snapshot"
        );

        // from here on the snapshot must end `ready` or `failed` even if this caller is dropped
        let creation = Creation {
            catalog: Arc::clone(&self.catalog),
            engine: Arc::clone(&self.engine),
            time_provider: Arc::clone(&self.time_provider),
            operations: Arc::clone(&gates.operations),
            tenant_id: tenant_id.clone(),
            snapshot_id: snapshot.id,
            lsn,
            _creating: creating,
            _access: access,
        };
        match tokio::spawn(creation.run()).await {
            Ok(result) => result,
            Err(join_error) => {
                let reason = format!("snapshot task did not complete: {join_error}");
                error!(
                    tenant = %tenant_id,
                    snapshot_id = %snapshot.id,
                    %reason,
                    "snapshot failed"
                );
                let now = self.time_provider.now();
                catalog.mark_snapshot_failed(snapshot.id, reason.clone(), now)?;
                self.checkpoint(tenant_id).await;
                Err(Error::CreationFailed {
                    tenant_id: tenant_id.clone(),
                    snapshot_id: snapshot.id,
                    source: anyhow::anyhow!(reason),
                })
            }
        }
    }

    pub fn get_snapshot(&self, tenant_id: &TenantId, snapshot_id: SnapshotId) -> Result<Snapshot> {
        self.catalog
            .tenant(tenant_id)
            .snapshot(snapshot_id)
            .ok_or_else(|| Error::NotFound {
                tenant_id: tenant_id.clone(),
                snapshot_id,
            })
    }

    /// Snapshots of the tenant matching `filter`, oldest first
    pub fn list_snapshots(&self, tenant_id: &TenantId, filter: SnapshotFilter) -> Vec<Snapshot> {
        self.catalog.tenant(tenant_id).list_snapshots(filter)
    }

    /// Apply the pre-operation snapshot policy before a session mutates the tenant.
    ///
    /// Returns the snapshot taken for the operation, if one was needed, so it can be recorded in
    /// the operation log. Reads never take one. A write takes one when it touches more records
    /// than the bulk threshold, or when the session has no ready snapshot younger than
    /// [`SnapshotConfig::session_snapshot_max_age`].
    pub async fn prepare_operation(
        &self,
        session_id: &SessionId,
        tenant_id: &TenantId,
        access: PlannedAccess,
    ) -> Result<Option<SnapshotId>> {
        let PlannedAccess::Write { record_count } = access else {
            return Ok(None);
        };

        let bulk = record_count > self.config.bulk_threshold;
        if !bulk && self.session_has_recent_snapshot(session_id, tenant_id) {
            debug!(tenant = %tenant_id, session = %session_id, "recent session snapshot found");
            return Ok(None);
        }

        let label = if bulk {
            format!("before bulk write of {record_count} records")
        } else {
            "first write of session".to_string()
        };
        let snapshot = self
            .create(
                tenant_id,
                SnapshotType::PreOperation,
                Some(label),
                Some(session_id.clone()),
            )
            .await?;
        Ok(Some(snapshot.id))
    }

    fn session_has_recent_snapshot(&self, session_id: &SessionId, tenant_id: &TenantId) -> bool {
        let now = self.time_provider.now();
        self.catalog
            .tenant(tenant_id)
            .list_snapshots(SnapshotFilter {
                snapshot_type: Some(SnapshotType::PreOperation),
                state: Some(SnapshotState::Ready),
            })
            .iter()
            .filter(|s| s.session_id.as_ref() == Some(session_id))
            .any(|s| {
                now.checked_duration_since(s.created_at())
                    .is_none_or(|age| age <= self.config.session_snapshot_max_age)
            })
    }

    /// Mark snapshots left `creating` by a previous process as `failed`. Returns their ids.
    pub async fn fail_interrupted(&self, tenant_id: &TenantId) -> Result<Vec<SnapshotId>> {
        let gates = self.gates(tenant_id);
        let _creating = gates.creation.lock().await;
        let _ops = gates.operations.lock().await;
        let catalog = self.catalog.tenant(tenant_id);
        let interrupted: Vec<SnapshotId> = catalog
            .list_snapshots(SnapshotFilter {
                state: Some(SnapshotState::Creating),
                ..Default::default()
            })
            .into_iter()
            .map(|s| s.id)
            .collect();
        let now = self.time_provider.now();
        for snapshot_id in &interrupted {
            catalog.mark_snapshot_failed(*snapshot_id, "interrupted by restart", now)?;
            warn!(tenant = %tenant_id, %snapshot_id, "snapshot interrupted by restart");
        }
        if !interrupted.is_empty() {
            self.checkpoint(tenant_id).await;
        }
        Ok(interrupted)
    }

    /// Expire a ready snapshot and release what the engine holds for it
    pub(crate) async fn expire(&self, snapshot: &Snapshot) -> Result<()> {
        let catalog = self.catalog.tenant(&snapshot.tenant_id);
        catalog.expire_snapshot(snapshot.id, self.time_provider.now())?;
        info!(
            tenant = %snapshot.tenant_id,
            snapshot_id = %snapshot.id,
            created_at = %snapshot.created_at(),
            "snapshot expired"
        );
        if let Some(artifact) = &snapshot.artifact {
            self.engine
                .release_snapshot(&snapshot.tenant_id, artifact)
                .await
                .map_err(|source| Error::Release {
                    tenant_id: snapshot.tenant_id.clone(),
                    snapshot_id: snapshot.id,
                    source,
                })?;
        }
        Ok(())
    }

    pub(crate) async fn checkpoint(&self, tenant_id: &TenantId) {
        if let Err(e) = self.catalog.checkpoint(tenant_id).await {
            warn!(tenant = %tenant_id, %e, "failed to checkpoint catalog");
        }
    }
}

/// The engine side of a snapshot creation and the transition out of `creating`.
///
/// Holds the tenant's creation gate and shared access until the snapshot is `ready` or `failed`.
#[derive(Debug)]
struct Creation {
    catalog: Arc<Catalog>,
    engine: Arc<dyn SnapshotEngine>,
    time_provider: Arc<dyn TimeProvider>,
    operations: Arc<Mutex<()>>,
    tenant_id: TenantId,
    snapshot_id: SnapshotId,
    lsn: Lsn,
    _creating: OwnedMutexGuard<()>,
    _access: SharedAccess,
}

impl Creation {
    async fn run(self) -> Result<Snapshot> {
        let tenant_id = &self.tenant_id;
        let snapshot_id = self.snapshot_id;
        let taken = self
            .engine
            .take_snapshot(tenant_id, snapshot_id, self.lsn)
            .await;

        let catalog = self.catalog.tenant(tenant_id);
        let result = {
            let _ops = self.operations.lock().await;
            let now = self.time_provider.now();
            match taken {
                Ok(artifact) => {
                    let ready = catalog.mark_snapshot_ready(snapshot_id, Some(artifact), now)?;
                    info!(tenant = %tenant_id, %snapshot_id, "snapshot ready");
                    Ok(ready)
                }
                Err(source) => {
                    error!(tenant = %tenant_id, %snapshot_id, %source, "snapshot failed");
                    catalog.mark_snapshot_failed(snapshot_id, source.to_string(), now)?;
                    Err(Error::CreationFailed {
                        tenant_id: tenant_id.clone(),
                        snapshot_id,
                        source,
                    })
                }
            }
        };
        if let Err(e) = self.catalog.checkpoint(tenant_id).await {
            warn!(tenant = %tenant_id, %e, "failed to checkpoint catalog");
        }
        result
    }
}
