//! Periodic expiry of old snapshots and deletion of archived WAL no snapshot depends on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use iox_time::TimeProvider;
use object_store::{ObjectStore, path::Path as ObjPath};
use observability_deps::tracing::{debug, error, info, warn};
use rewind_catalog::{
    Catalog, TenantDirectory, TenantDirectoryError, TenantLockedError, TenantUsage,
};
use rewind_id::{SnapshotId, TenantId};
use rewind_shutdown::ShutdownToken;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{RetentionConfig, manager::SnapshotManager};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("listing tenants: {0}")]
    ListTenants(#[from] TenantDirectoryError),

    #[error("skipped: {0}")]
    TenantLocked(#[from] TenantLockedError),

    #[error("expiring snapshot {snapshot_id}: {source}")]
    Expire {
        snapshot_id: SnapshotId,
        source: crate::Error,
    },

    #[error("deleting archived segment {segment}: {source}")]
    DeleteSegment {
        segment: Arc<str>,
        source: object_store::Error,
    },
}

/// Outcome of sweeping one tenant
#[derive(Debug)]
pub struct TenantSweep {
    pub tenant_id: TenantId,
    pub expired: Vec<SnapshotId>,
    pub deleted_segments: Vec<Arc<str>>,
    pub reclaimed_bytes: u64,
    /// Usage after the sweep
    pub usage: TenantUsage,
    pub errors: Vec<SweepError>,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub tenants: Vec<TenantSweep>,
    /// Failures not tied to a single tenant
    pub errors: Vec<SweepError>,
}

impl SweepReport {
    pub fn tenant(&self, tenant_id: &TenantId) -> Option<&TenantSweep> {
        self.tenants.iter().find(|t| &t.tenant_id == tenant_id)
    }

    pub fn error_count(&self) -> usize {
        self.errors.len() + self.tenants.iter().map(|t| t.errors.len()).sum::<usize>()
    }
}

#[derive(Debug)]
pub struct RetentionSchedulerArgs {
    pub manager: Arc<SnapshotManager>,
    pub catalog: Arc<Catalog>,
    pub object_store: Arc<dyn ObjectStore>,
    pub directory: Arc<dyn TenantDirectory>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub config: RetentionConfig,
}

#[derive(Debug)]
pub struct RetentionScheduler {
    manager: Arc<SnapshotManager>,
    catalog: Arc<Catalog>,
    object_store: Arc<dyn ObjectStore>,
    directory: Arc<dyn TenantDirectory>,
    time_provider: Arc<dyn TimeProvider>,
    config: RetentionConfig,
}

impl RetentionScheduler {
    pub fn new(
        RetentionSchedulerArgs {
            manager,
            catalog,
            object_store,
            directory,
            time_provider,
            config,
        }: RetentionSchedulerArgs,
    ) -> Self {
        Self {
            manager,
            catalog,
            object_store,
            directory,
            time_provider,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: ShutdownToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(&self, shutdown: ShutdownToken) {
        info!(interval = ?self.config.interval, "retention scheduler started");
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => break,
                _ = interval.tick() => {}
            }
            let report = self.sweep().await;
            for e in &report.errors {
                error!(%e, "retention sweep error");
            }
            for tenant in &report.tenants {
                for e in &tenant.errors {
                    error!(tenant = %tenant.tenant_id, %e, "retention sweep error");
                }
            }
        }
        info!("retention scheduler stopped");
        shutdown.complete();
    }

    /// Sweep every known tenant in parallel. Failures are collected in the report.
    pub async fn sweep(&self) -> SweepReport {
        let mut errors = vec![];
        let mut windows: BTreeMap<TenantId, Duration> = self
            .catalog
            .tenant_ids()
            .into_iter()
            .map(|t| (t, self.config.retention_window))
            .collect();
        match self.directory.list().await {
            Ok(tenants) => {
                for tenant in tenants {
                    windows.insert(
                        tenant.id,
                        tenant.retention_window.unwrap_or(self.config.retention_window),
                    );
                }
            }
            Err(e) => {
                warn!(%e, "failed to list tenants, sweeping known tenants with the default window");
                errors.push(e.into());
            }
        }

        let tenants = join_all(
            windows
                .into_iter()
                .map(|(tenant_id, window)| self.sweep_tenant(tenant_id, window)),
        )
        .await;
        SweepReport { tenants, errors }
    }

    async fn sweep_tenant(&self, tenant_id: TenantId, window: Duration) -> TenantSweep {
        let catalog = self.catalog.tenant(&tenant_id);
        let mut sweep = TenantSweep {
            tenant_id: tenant_id.clone(),
            expired: vec![],
            deleted_segments: vec![],
            reclaimed_bytes: 0,
            usage: TenantUsage::default(),
            errors: vec![],
        };

        // a restore in progress or a failed one owns the tenant's snapshots and WAL
        let _access = match self.manager.locks().shared(&tenant_id) {
            Ok(access) => access,
            Err(e) => {
                info!(tenant = %tenant_id, state = %e.state, "tenant locked, not sweeping");
                sweep.errors.push(e.into());
                sweep.usage = catalog.usage();
                return sweep;
            }
        };
        let _ops = self.manager.lock_operations(&tenant_id).await;
        let now = self.time_provider.now();

        let ready = catalog.ready_snapshots_newest_first();
        for snapshot in ready.iter().skip(self.config.min_preserved) {
            let age = now
                .checked_duration_since(snapshot.created_at())
                .unwrap_or_default();
            if age <= window {
                continue;
            }
            match self.manager.expire(snapshot).await {
                Ok(()) => sweep.expired.push(snapshot.id),
                Err(source) => {
                    // the catalog already has it expired when only the engine release failed
                    if matches!(source, crate::Error::Release { .. }) {
                        sweep.expired.push(snapshot.id);
                    }
                    sweep.errors.push(SweepError::Expire {
                        snapshot_id: snapshot.id,
                        source,
                    });
                }
            }
        }

        // the oldest ready snapshot decides which WAL is still needed for replay
        let oldest_needed = catalog
            .ready_snapshots_newest_first()
            .iter()
            .map(|s| s.lsn)
            .min();
        match oldest_needed {
            None => debug!(tenant = %tenant_id, "no ready snapshot, keeping all archived WAL"),
            Some(lsn) => {
                for segment in catalog.segments() {
                    if segment.end_lsn > lsn {
                        continue;
                    }
                    let path = ObjPath::from(segment.archive_path.as_str());
                    match self.object_store.delete(&path).await {
                        Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                            catalog.remove_segment(&segment.segment_name);
                            sweep.reclaimed_bytes += segment.size_bytes;
                            sweep.deleted_segments.push(segment.segment_name);
                        }
                        Err(source) => {
                            warn!(
                                tenant = %tenant_id,
                                segment = %segment.segment_name,
                                %source,
                                "failed to delete archived segment"
                            );
                            sweep.errors.push(SweepError::DeleteSegment {
                                segment: segment.segment_name,
                                source,
                            });
                        }
                    }
                }
            }
        }

        if !sweep.expired.is_empty() || !sweep.deleted_segments.is_empty() {
            self.manager.checkpoint(&tenant_id).await;
        }
        sweep.usage = catalog.usage();
        info!(
            tenant = %tenant_id,
            expired = sweep.expired.len(),
            deleted_segments = sweep.deleted_segments.len(),
            reclaimed_bytes = sweep.reclaimed_bytes,
            archived_bytes = sweep.usage.archived_bytes,
            errors = sweep.errors.len(),
            "retention sweep finished"
        );
        sweep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SnapshotConfig, engine::MemorySnapshotEngine, manager::SnapshotManagerArgs};
    use iox_time::{MockProvider, Time};
    use object_store::{PutPayload, memory::InMemory};
    use pretty_assertions::assert_eq;
    use rewind_catalog::{
        ConnectionDescriptor, InMemoryTenantDirectory, SnapshotState, SnapshotType, Tenant,
        TenantLockManager, TenantLockState, WalSegmentRecord, paths::ArchivedSegmentPath,
    };
    use rewind_id::Lsn;
    use rewind_shutdown::ShutdownManager;
    use rewind_test_helpers::object_store::FlakyObjectStore;

    const DAY: u64 = 24 * 60 * 60;
    const SEGMENT: u64 = 16 * 1024 * 1024;

    fn days(n: u64) -> Duration {
        Duration::from_secs(n * DAY)
    }

    struct Harness {
        scheduler: Arc<RetentionScheduler>,
        manager: Arc<SnapshotManager>,
        catalog: Arc<Catalog>,
        engine: Arc<MemorySnapshotEngine>,
        store: Arc<FlakyObjectStore>,
        directory: Arc<InMemoryTenantDirectory>,
        locks: Arc<TenantLockManager>,
        time: Arc<MockProvider>,
        start: Time,
    }

    fn harness() -> Harness {
        let start = Time::from_timestamp(100 * DAY as i64, 0).unwrap();
        let time = Arc::new(MockProvider::new(start));
        let catalog = Arc::new(Catalog::new());
        let engine = Arc::new(MemorySnapshotEngine::new());
        let store = Arc::new(FlakyObjectStore::new(Arc::new(InMemory::new())));
        let directory = Arc::new(InMemoryTenantDirectory::default());
        let locks = Arc::new(TenantLockManager::new());
        let manager = Arc::new(SnapshotManager::new(SnapshotManagerArgs {
            catalog: Arc::clone(&catalog),
            engine: Arc::clone(&engine) as _,
            locks: Arc::clone(&locks),
            time_provider: Arc::clone(&time) as _,
            config: SnapshotConfig::default(),
        }));
        let scheduler = Arc::new(RetentionScheduler::new(RetentionSchedulerArgs {
            manager: Arc::clone(&manager),
            catalog: Arc::clone(&catalog),
            object_store: Arc::clone(&store) as _,
            directory: Arc::clone(&directory) as _,
            time_provider: Arc::clone(&time) as _,
            config: RetentionConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        }));
        Harness {
            scheduler,
            manager,
            catalog,
            engine,
            store,
            directory,
            locks,
            time,
            start,
        }
    }

    impl Harness {
        /// Take a ready snapshot `age_days` before the sweep, which runs at `start`
        async fn snapshot_aged(&self, tenant: &TenantId, age_days: u64, lsn: u64) -> SnapshotId {
            self.time.set(self.start - days(age_days));
            self.engine.set_lsn(tenant, Lsn::new(lsn));
            let snapshot = self
                .manager
                .create_snapshot(tenant, SnapshotType::Auto, None)
                .await
                .unwrap();
            self.time.set(self.start);
            snapshot.id
        }

        /// Archive segments `0..n` of the tenant
        async fn archive_segments(&self, tenant: &TenantId, n: u64) {
            let catalog = self.catalog.tenant(tenant);
            for i in 0..n {
                let name = format!("00000001000000000000{i:04X}");
                let path = ArchivedSegmentPath::new(tenant, &name);
                self.store
                    .put(&path, PutPayload::from_static(b"compressed wal"))
                    .await
                    .unwrap();
                catalog.add_segment(WalSegmentRecord {
                    tenant_id: tenant.clone(),
                    segment_name: name.as_str().into(),
                    archive_path: path.to_string(),
                    compressed: true,
                    size_bytes: 14,
                    start_lsn: Lsn::new(i * SEGMENT),
                    end_lsn: Lsn::new((i + 1) * SEGMENT),
                    archived_at_ns: 0,
                });
            }
        }

        fn states(&self, tenant: &TenantId) -> Vec<(SnapshotId, SnapshotState)> {
            self.manager
                .list_snapshots(tenant, Default::default())
                .into_iter()
                .map(|s| (s.id, s.state))
                .collect()
        }
    }

    #[test_log::test(tokio::test)]
    async fn expires_beyond_window_but_keeps_most_recent() {
        let h = harness();
        let acme = TenantId::from("acme");
        let old = h.snapshot_aged(&acme, 40, 0).await;
        let mut kept = vec![];
        for (age, segment) in [(20, 1), (5, 2), (1, 3)] {
            kept.push(h.snapshot_aged(&acme, age, segment * SEGMENT).await);
        }

        // three snapshots all beyond the window are still kept
        let globex = TenantId::from("globex");
        for age in [90, 80, 70] {
            h.snapshot_aged(&globex, age, 0).await;
        }

        let report = h.scheduler.sweep().await;
        assert_eq!(report.error_count(), 0);
        assert_eq!(report.tenant(&acme).unwrap().expired, vec![old]);
        assert!(report.tenant(&globex).unwrap().expired.is_empty());

        let mut expected = vec![(old, SnapshotState::Expired)];
        expected.extend(kept.iter().map(|id| (*id, SnapshotState::Ready)));
        assert_eq!(h.states(&acme), expected);
        assert_eq!(h.engine.released().len(), 1);
    }

    #[tokio::test]
    async fn never_expires_the_most_recent_regardless_of_age() {
        let h = harness();
        let acme = TenantId::from("acme");
        let mut ids = vec![];
        for age in [60, 55, 50, 45, 40, 35] {
            ids.push(h.snapshot_aged(&acme, age, 0).await);
        }

        let report = h.scheduler.sweep().await;
        assert_eq!(report.tenant(&acme).unwrap().expired, ids[..3].to_vec());
        let ready: Vec<SnapshotId> = h
            .catalog
            .tenant(&acme)
            .ready_snapshots_newest_first()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ready, vec![ids[5], ids[4], ids[3]]);
    }

    #[tokio::test]
    async fn tenant_window_overrides_default() {
        let h = harness();
        let acme = TenantId::from("acme");
        h.directory.insert(
            Tenant::new("acme", ConnectionDescriptor::new("postgres://acme"))
                .with_retention_window(days(3)),
        );
        let old = h.snapshot_aged(&acme, 4, 0).await;
        for age in [2, 1, 0] {
            h.snapshot_aged(&acme, age, 0).await;
        }

        let report = h.scheduler.sweep().await;
        assert_eq!(report.tenant(&acme).unwrap().expired, vec![old]);
    }

    #[tokio::test]
    async fn deletes_only_wal_older_than_oldest_ready_snapshot() {
        let h = harness();
        let acme = TenantId::from("acme");
        h.archive_segments(&acme, 5).await;

        // without a ready snapshot every segment is kept
        let report = h.scheduler.sweep().await;
        assert!(report.tenant(&acme).unwrap().deleted_segments.is_empty());

        // a snapshot in the middle of segment 2
        h.snapshot_aged(&acme, 1, 2 * SEGMENT + 10).await;
        let report = h.scheduler.sweep().await;
        let sweep = report.tenant(&acme).unwrap();
        assert_eq!(sweep.deleted_segments.len(), 2);
        assert_eq!(sweep.reclaimed_bytes, 28);
        assert_eq!(sweep.usage.archived_segments, 3);
        assert_eq!(sweep.usage.ready_snapshots, 1);

        let remaining = h.catalog.tenant(&acme).segments();
        assert_eq!(remaining[0].start_lsn, Lsn::new(2 * SEGMENT));
        let first = ArchivedSegmentPath::new(&acme, "000000010000000000000000");
        assert!(matches!(
            h.store.get(&first).await,
            Err(object_store::Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn failed_deletion_does_not_stop_the_sweep() {
        let h = harness();
        let acme = TenantId::from("acme");
        let globex = TenantId::from("globex");
        for tenant in [&acme, &globex] {
            h.archive_segments(tenant, 3).await;
            h.snapshot_aged(tenant, 1, 3 * SEGMENT).await;
        }
        let stuck = ArchivedSegmentPath::new(&acme, "000000010000000000000001");
        h.store.fail_deletes_of(stuck.to_string());

        let report = h.scheduler.sweep().await;
        assert_eq!(report.error_count(), 1);
        let acme_sweep = report.tenant(&acme).unwrap();
        assert_eq!(acme_sweep.deleted_segments.len(), 2);
        assert!(matches!(
            &acme_sweep.errors[0],
            SweepError::DeleteSegment { segment, .. } if segment.as_ref() == "000000010000000000000001"
        ));
        assert_eq!(report.tenant(&globex).unwrap().deleted_segments.len(), 3);
        // the record stays so the next sweep tries again
        assert_eq!(h.catalog.tenant(&acme).segments().len(), 1);
    }

    #[tokio::test]
    async fn skips_tenants_held_by_a_restore() {
        let h = harness();
        let acme = TenantId::from("acme");
        h.archive_segments(&acme, 5).await;
        let old = h.snapshot_aged(&acme, 40, 2 * SEGMENT).await;
        for (age, segment) in [(20, 3), (5, 4), (1, 4)] {
            h.snapshot_aged(&acme, age, segment * SEGMENT).await;
        }

        let mut claim = h.locks.try_claim_exclusive(&acme).unwrap();
        claim.acquire().await;

        let report = h.scheduler.sweep().await;
        let sweep = report.tenant(&acme).unwrap();
        assert!(sweep.expired.is_empty());
        assert!(sweep.deleted_segments.is_empty());
        assert!(matches!(sweep.errors.as_slice(), [SweepError::TenantLocked(_)]));
        assert_eq!(h.states(&acme)[0], (old, SnapshotState::Ready));
        assert!(h.engine.released().is_empty());
        assert_eq!(h.catalog.tenant(&acme).segments().len(), 5);
        assert_eq!(h.locks.state(&acme), TenantLockState::Restoring);

        // a failed restore keeps the tenant out of the sweep until it is cleared
        claim.fail("base backup unreadable");
        let report = h.scheduler.sweep().await;
        assert!(report.tenant(&acme).unwrap().expired.is_empty());

        assert!(h.locks.clear_failed(&acme));
        let report = h.scheduler.sweep().await;
        let sweep = report.tenant(&acme).unwrap();
        assert_eq!(sweep.expired, vec![old]);
        assert_eq!(sweep.deleted_segments.len(), 3);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let h = harness();
        let acme = TenantId::from("acme");
        for age in [60, 3, 2, 1] {
            h.snapshot_aged(&acme, age, 0).await;
        }
        let manager = ShutdownManager::new_testing();
        let handle = Arc::clone(&h.scheduler).spawn(manager.register("retention"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.catalog.tenant(&acme).ready_snapshots_newest_first().len() > 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        manager.shutdown();
        manager.join().await;
        handle.await.unwrap();
    }
}
