use std::{sync::Arc, time::Duration};

use iox_time::{Time, TimeProvider};
use observability_deps::tracing::{error, info, warn};
use rewind_catalog::{
    Catalog, ExclusiveClaim, MaintenanceIndicator, RestoreEvent, RestoreOutcome, RestoreTarget,
    Snapshot, SnapshotState, TenantDirectory, TenantLockManager, TenantLockState,
};
use rewind_id::{Lsn, SnapshotId, TenantId};
use serde::Serialize;

use crate::{
    Error, RestoreConfig, Result,
    engine::{RestoreEngine, RestorePlan},
};

/// Where a tenant stands with respect to restores
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreStatus {
    pub tenant_id: TenantId,
    pub lock: TenantLockState,
    /// Most recent first
    pub events: Vec<RestoreEvent>,
}

#[derive(Debug)]
pub struct RestoreOrchestratorArgs {
    pub catalog: Arc<Catalog>,
    pub engine: Arc<dyn RestoreEngine>,
    pub locks: Arc<TenantLockManager>,
    pub directory: Arc<dyn TenantDirectory>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub config: RestoreConfig,
}

#[derive(Debug)]
pub struct RestoreOrchestrator {
    catalog: Arc<Catalog>,
    engine: Arc<dyn RestoreEngine>,
    locks: Arc<TenantLockManager>,
    directory: Arc<dyn TenantDirectory>,
    time_provider: Arc<dyn TimeProvider>,
    config: RestoreConfig,
}

impl RestoreOrchestrator {
    pub fn new(
        RestoreOrchestratorArgs {
            catalog,
            engine,
            locks,
            directory,
            time_provider,
            config,
        }: RestoreOrchestratorArgs,
    ) -> Self {
        Self {
            catalog,
            engine,
            locks,
            directory,
            time_provider,
            config,
        }
    }

    pub async fn restore_to_snapshot(
        &self,
        tenant_id: &TenantId,
        snapshot_id: SnapshotId,
    ) -> Result<RestoreEvent> {
        self.restore(tenant_id, RestoreTarget::Snapshot { snapshot_id })
            .await
    }

    pub async fn restore_to_timestamp(
        &self,
        tenant_id: &TenantId,
        timestamp: Time,
    ) -> Result<RestoreEvent> {
        self.restore(tenant_id, RestoreTarget::Timestamp {
            timestamp_ns: timestamp.timestamp_nanos(),
        })
        .await
    }

    async fn restore(&self, tenant_id: &TenantId, target: RestoreTarget) -> Result<RestoreEvent> {
        let claim = self.locks.try_claim_exclusive(tenant_id)?;

        let plan = match self.plan(tenant_id, target) {
            Ok(plan) => plan,
            Err(e) => {
                claim.release();
                return Err(e);
            }
        };

        let event = self.catalog.tenant(tenant_id).record_restore_started(
            target,
            Some(plan.base_snapshot.id),
            self.time_provider.now(),
        );
        info!(
            tenant = %tenant_id,
            event_id = %event.id,
            %target,
            base_snapshot_id = %plan.base_snapshot.id,
            n_segments = plan.segments.len(),
            "restore started"
        );

        // the event and the maintenance indicator must reach an outcome even if this caller is
        // dropped, so the restore runs on its own task
        let run = RestoreRun {
            catalog: Arc::clone(&self.catalog),
            engine: Arc::clone(&self.engine),
            directory: Arc::clone(&self.directory),
            time_provider: Arc::clone(&self.time_provider),
            max_duration: self.config.max_duration,
        };
        match tokio::spawn(run.clone().execute(claim, plan, event.clone())).await {
            Ok(result) => result,
            Err(join_error) => {
                // the claim was dropped with the task, which leaves the tenant failed
                let reason = format!("restore task did not complete: {join_error}");
                error!(tenant = %tenant_id, event_id = %event.id, %reason, "restore failed");
                run.finish_event(&event, RestoreOutcome::Failed {
                    reason: reason.clone(),
                })
                .await;
                Err(Error::Failed {
                    tenant_id: tenant_id.clone(),
                    event_id: event.id,
                    source: anyhow::anyhow!(reason),
                })
            }
        }
    }

    /// Work out the base snapshot and the WAL to replay for `target`
    pub fn plan(&self, tenant_id: &TenantId, target: RestoreTarget) -> Result<RestorePlan> {
        let catalog = self.catalog.tenant(tenant_id);
        match target {
            RestoreTarget::Snapshot { snapshot_id } => {
                let snapshot =
                    catalog
                        .snapshot(snapshot_id)
                        .ok_or_else(|| Error::SnapshotNotFound {
                            tenant_id: tenant_id.clone(),
                            snapshot_id,
                        })?;
                if snapshot.state != SnapshotState::Ready {
                    return Err(Error::SnapshotNotRestorable {
                        tenant_id: tenant_id.clone(),
                        snapshot_id,
                        state: snapshot.state,
                    });
                }
                Ok(RestorePlan {
                    tenant_id: tenant_id.clone(),
                    target,
                    base_snapshot: snapshot,
                    segments: vec![],
                    recovery_target_time: None,
                })
            }
            RestoreTarget::Timestamp { timestamp_ns } => {
                let requested = Time::from_timestamp_nanos(timestamp_ns);
                let now = self.time_provider.now();
                if requested > now {
                    return Err(Error::TargetInFuture {
                        tenant_id: tenant_id.clone(),
                        requested,
                        now,
                    });
                }

                let bases = restorable_bases(
                    &catalog.ready_snapshots_newest_first(),
                    catalog.oldest_segment().map(|s| s.start_lsn),
                );
                let Some(earliest) = bases.last().map(|s| s.created_at()) else {
                    return Err(Error::NothingRestorable {
                        tenant_id: tenant_id.clone(),
                    });
                };
                let Some(base) = bases.into_iter().find(|s| s.created_at() <= requested) else {
                    return Err(Error::OutOfRange {
                        tenant_id: tenant_id.clone(),
                        requested,
                        earliest,
                    });
                };

                let segments = catalog
                    .segments()
                    .into_iter()
                    .filter(|s| s.end_lsn > base.lsn)
                    .collect();
                Ok(RestorePlan {
                    tenant_id: tenant_id.clone(),
                    target,
                    base_snapshot: base,
                    segments,
                    recovery_target_time: Some(requested),
                })
            }
        }
    }

    /// Unlock a tenant left locked by a failed restore. Returns `false` if it was not failed.
    pub async fn clear_failed(&self, tenant_id: &TenantId) -> Result<bool> {
        if !self.locks.clear_failed(tenant_id) {
            return Ok(false);
        }
        self.directory
            .set_maintenance(tenant_id, MaintenanceIndicator::None)
            .await?;
        Ok(true)
    }

    pub fn status(&self, tenant_id: &TenantId) -> RestoreStatus {
        let mut events = self.catalog.tenant(tenant_id).restore_events();
        events.reverse();
        RestoreStatus {
            tenant_id: tenant_id.clone(),
            lock: self.locks.state(tenant_id),
            events,
        }
    }
}

/// A planned restore from the moment its event is recorded until it has an outcome
#[derive(Debug, Clone)]
struct RestoreRun {
    catalog: Arc<Catalog>,
    engine: Arc<dyn RestoreEngine>,
    directory: Arc<dyn TenantDirectory>,
    time_provider: Arc<dyn TimeProvider>,
    max_duration: Duration,
}

impl RestoreRun {
    async fn execute(
        self,
        mut claim: ExclusiveClaim,
        plan: RestorePlan,
        event: RestoreEvent,
    ) -> Result<RestoreEvent> {
        let tenant_id = plan.tenant_id.clone();
        let started = Time::from_timestamp_nanos(event.started_at_ns);

        if let Err(e) = self
            .directory
            .set_maintenance(&tenant_id, MaintenanceIndicator::restoring(started))
            .await
        {
            // nothing has been touched yet, so the tenant can stay online
            claim.release();
            self.finish_event(&event, RestoreOutcome::Failed {
                reason: e.to_string(),
            })
            .await;
            return Err(e.into());
        }

        let max_duration = self.max_duration;
        let outcome = tokio::time::timeout(max_duration, async {
            claim.acquire().await;
            self.engine.restore(&plan).await
        })
        .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(source)) => Some(Error::Failed {
                tenant_id: tenant_id.clone(),
                event_id: event.id,
                source,
            }),
            Err(_) => Some(Error::TimedOut {
                tenant_id: tenant_id.clone(),
                event_id: event.id,
                max_duration,
            }),
        };

        match failure {
            None => {
                if let Err(e) = self
                    .directory
                    .set_maintenance(&tenant_id, MaintenanceIndicator::None)
                    .await
                {
                    warn!(tenant = %tenant_id, %e, "failed to clear maintenance indicator");
                }
                claim.release();
                let finished = self.finish_event(&event, RestoreOutcome::Completed).await;
                info!(tenant = %tenant_id, event_id = %event.id, "restore completed");
                Ok(finished)
            }
            Some(e) => {
                let reason = e.to_string();
                error!(tenant = %tenant_id, event_id = %event.id, %reason, "restore failed");
                claim.fail(reason.clone());
                if let Err(directory_error) = self
                    .directory
                    .set_maintenance(&tenant_id, MaintenanceIndicator::Failed {
                        reason: reason.clone(),
                    })
                    .await
                {
                    warn!(tenant = %tenant_id, %directory_error, "failed to set maintenance indicator");
                }
                self.finish_event(&event, RestoreOutcome::Failed { reason })
                    .await;
                Err(e)
            }
        }
    }

    async fn finish_event(&self, event: &RestoreEvent, outcome: RestoreOutcome) -> RestoreEvent {
        let tenant_id = &event.tenant_id;
        let now = self.time_provider.now();
        let finished = match self
            .catalog
            .tenant(tenant_id)
            .finish_restore_event(event.id, outcome.clone(), now)
        {
            Ok(finished) => finished,
            Err(e) => {
                warn!(tenant = %tenant_id, event_id = %event.id, %e, "failed to record restore outcome");
                RestoreEvent {
                    outcome,
                    finished_at_ns: Some(now.timestamp_nanos()),
                    ..event.clone()
                }
            }
        };
        if let Err(e) = self.catalog.checkpoint(tenant_id).await {
            warn!(tenant = %tenant_id, %e, "failed to checkpoint catalog");
        }
        finished
    }
}

/// Ready snapshots whose WAL is still archived, newest first. Replay from a snapshot needs every
/// segment from its position on, so snapshots older than the oldest archived segment are only
/// restorable as themselves.
fn restorable_bases(ready_newest_first: &[Snapshot], oldest_wal: Option<Lsn>) -> Vec<Snapshot> {
    ready_newest_first
        .iter()
        .filter(|s| oldest_wal.is_none_or(|start| s.lsn >= start))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::MemoryRestoreEngine;
    use iox_time::MockProvider;
    use pretty_assertions::assert_eq;
    use rewind_catalog::{
        ConnectionDescriptor, InMemoryTenantDirectory, SnapshotType, Tenant, WalSegmentRecord,
    };

    const SEGMENT: u64 = 16 * 1024 * 1024;
    const HOUR: Duration = Duration::from_secs(60 * 60);

    struct Harness {
        orchestrator: Arc<RestoreOrchestrator>,
        catalog: Arc<Catalog>,
        engine: Arc<MemoryRestoreEngine>,
        locks: Arc<TenantLockManager>,
        directory: Arc<InMemoryTenantDirectory>,
        time: Arc<MockProvider>,
        acme: TenantId,
    }

    fn harness(max_duration: Duration) -> Harness {
        let catalog = Arc::new(Catalog::new());
        let engine = Arc::new(MemoryRestoreEngine::new());
        let locks = Arc::new(TenantLockManager::new());
        let directory = Arc::new(InMemoryTenantDirectory::new(
            ["acme", "globex"]
                .map(|t| Tenant::new(t, ConnectionDescriptor::new(format!("postgres://db/{t}")))),
        ));
        let time = Arc::new(MockProvider::new(Time::from_timestamp(1_000_000, 0).unwrap()));
        let orchestrator = Arc::new(RestoreOrchestrator::new(RestoreOrchestratorArgs {
            catalog: Arc::clone(&catalog),
            engine: Arc::clone(&engine) as _,
            locks: Arc::clone(&locks),
            directory: Arc::clone(&directory) as _,
            time_provider: Arc::clone(&time) as _,
            config: RestoreConfig { max_duration },
        }));
        Harness {
            orchestrator,
            catalog,
            engine,
            locks,
            directory,
            time,
            acme: "acme".into(),
        }
    }

    impl Harness {
        /// A ready snapshot taken `hours_ago` before now at WAL position `lsn`
        fn snapshot(&self, tenant: &TenantId, hours_ago: u32, lsn: u64) -> Snapshot {
            let at = self.time.now() - HOUR * hours_ago;
            let catalog = self.catalog.tenant(tenant);
            let snapshot = catalog
                .begin_snapshot(SnapshotType::Auto, None, None, Lsn::new(lsn), at, None)
                .unwrap();
            catalog
                .mark_snapshot_ready(snapshot.id, Some(format!("artifact-{}", snapshot.id)), at)
                .unwrap()
        }

        fn segments(&self, tenant: &TenantId, range: std::ops::Range<u64>) {
            let catalog = self.catalog.tenant(tenant);
            for i in range {
                catalog.add_segment(WalSegmentRecord {
                    tenant_id: tenant.clone(),
                    segment_name: format!("00000001000000000000{i:04X}").into(),
                    archive_path: format!("{tenant}/wal/{i}.gz"),
                    compressed: true,
                    size_bytes: 10,
                    start_lsn: Lsn::new(i * SEGMENT),
                    end_lsn: Lsn::new((i + 1) * SEGMENT),
                    archived_at_ns: 0,
                });
            }
        }

        async fn maintenance(&self, tenant: &TenantId) -> MaintenanceIndicator {
            self.directory.get(tenant).await.unwrap().maintenance
        }
    }

    #[test_log::test(tokio::test)]
    async fn restore_to_snapshot_completes_and_releases() {
        let h = harness(HOUR);
        let snapshot = h.snapshot(&h.acme, 2, 0);

        let event = h
            .orchestrator
            .restore_to_snapshot(&h.acme, snapshot.id)
            .await
            .unwrap();
        assert_eq!(event.outcome, RestoreOutcome::Completed);
        assert_eq!(event.base_snapshot_id, Some(snapshot.id));
        assert!(event.finished_at_ns.is_some());

        let restored = h.engine.restored();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].base_snapshot, snapshot);
        assert!(restored[0].segments.is_empty());

        assert_eq!(h.locks.state(&h.acme), TenantLockState::Available);
        assert_eq!(h.maintenance(&h.acme).await, MaintenanceIndicator::None);
        assert_eq!(h.orchestrator.status(&h.acme).events, vec![event]);
    }

    #[tokio::test]
    async fn invalid_targets_release_the_tenant() {
        let h = harness(HOUR);
        let err = h
            .orchestrator
            .restore_to_snapshot(&h.acme, SnapshotId::new(42))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotNotFound { .. }));

        let snapshot = h.snapshot(&h.acme, 1, 0);
        h.catalog
            .tenant(&h.acme)
            .expire_snapshot(snapshot.id, h.time.now())
            .unwrap();
        let err = h
            .orchestrator
            .restore_to_snapshot(&h.acme, snapshot.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotNotRestorable { state: SnapshotState::Expired, .. }));

        let err = h
            .orchestrator
            .restore_to_timestamp(&h.acme, h.time.now() - HOUR)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NothingRestorable { .. }));

        assert_eq!(h.locks.state(&h.acme), TenantLockState::Available);
        assert!(h.orchestrator.status(&h.acme).events.is_empty());
    }

    #[tokio::test]
    async fn timestamp_before_retained_wal_reports_earliest() {
        let h = harness(HOUR);
        // the WAL behind the oldest snapshot was already swept
        h.snapshot(&h.acme, 48, 0);
        let oldest_restorable = h.snapshot(&h.acme, 24, 2 * SEGMENT);
        h.snapshot(&h.acme, 1, 4 * SEGMENT);
        h.segments(&h.acme, 2..6);

        let err = h
            .orchestrator
            .restore_to_timestamp(&h.acme, h.time.now() - HOUR * 30)
            .await
            .unwrap_err();
        let Error::OutOfRange { earliest, .. } = err else {
            panic!("expected out of range, got {err:?}");
        };
        assert_eq!(earliest, oldest_restorable.created_at());
        assert_eq!(h.locks.state(&h.acme), TenantLockState::Available);

        let err = h
            .orchestrator
            .restore_to_timestamp(&h.acme, h.time.now() + HOUR)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TargetInFuture { .. }));
    }

    #[tokio::test]
    async fn timestamp_restore_replays_from_newest_earlier_snapshot() {
        let h = harness(HOUR);
        h.snapshot(&h.acme, 24, 0);
        let base = h.snapshot(&h.acme, 12, 2 * SEGMENT + 100);
        h.snapshot(&h.acme, 1, 4 * SEGMENT);
        h.segments(&h.acme, 0..6);

        let target = h.time.now() - HOUR * 6;
        let event = h
            .orchestrator
            .restore_to_timestamp(&h.acme, target)
            .await
            .unwrap();
        assert_eq!(event.base_snapshot_id, Some(base.id));
        assert_eq!(event.target, RestoreTarget::Timestamp {
            timestamp_ns: target.timestamp_nanos()
        });

        let plan = &h.engine.restored()[0];
        assert_eq!(plan.recovery_target_time, Some(target));
        let first = plan.segments.first().unwrap();
        assert_eq!(first.start_lsn, Lsn::new(2 * SEGMENT));
        assert_eq!(plan.segments.len(), 4);
    }

    #[tokio::test]
    async fn concurrent_restore_of_same_tenant_is_refused() {
        let h = harness(HOUR);
        let globex = TenantId::from("globex");
        let acme_snapshot = h.snapshot(&h.acme, 1, 0);
        let globex_snapshot = h.snapshot(&globex, 1, 0);
        h.engine.pause(&h.acme);

        let first = tokio::spawn({
            let orchestrator = Arc::clone(&h.orchestrator);
            let acme = h.acme.clone();
            async move { orchestrator.restore_to_snapshot(&acme, acme_snapshot.id).await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.locks.state(&h.acme) != TenantLockState::Restoring {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            h.maintenance(&h.acme).await,
            MaintenanceIndicator::restoring(h.time.now())
        );

        let err = h
            .orchestrator
            .restore_to_snapshot(&h.acme, acme_snapshot.id)
            .await
            .unwrap_err();
        let Error::TenantLocked(locked) = err else {
            panic!("expected tenant locked, got {err:?}");
        };
        assert_eq!(locked.state, TenantLockState::Restoring);
        // application access is blocked too
        assert!(h.locks.shared(&h.acme).is_err());

        // another tenant restores independently
        h.orchestrator
            .restore_to_snapshot(&globex, globex_snapshot.id)
            .await
            .unwrap();
        assert!(h.locks.shared(&globex).is_ok());

        h.engine.resume(&h.acme);
        first.await.unwrap().unwrap();
        assert_eq!(h.locks.state(&h.acme), TenantLockState::Available);
    }

    #[tokio::test]
    async fn abandoned_restore_still_reaches_an_outcome() {
        let h = harness(HOUR);
        let snapshot = h.snapshot(&h.acme, 1, 0);
        h.engine.pause(&h.acme);

        let restore = tokio::spawn({
            let orchestrator = Arc::clone(&h.orchestrator);
            let acme = h.acme.clone();
            async move { orchestrator.restore_to_snapshot(&acme, snapshot.id).await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.locks.state(&h.acme) != TenantLockState::Restoring {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // the caller goes away mid-restore
        restore.abort();
        assert!(restore.await.unwrap_err().is_cancelled());
        h.engine.resume(&h.acme);

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.orchestrator.status(&h.acme).events[0].outcome == RestoreOutcome::InProgress {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let status = h.orchestrator.status(&h.acme);
        assert_eq!(status.events[0].outcome, RestoreOutcome::Completed);
        assert_eq!(status.lock, TenantLockState::Available);
        assert_eq!(h.maintenance(&h.acme).await, MaintenanceIndicator::None);
        assert_eq!(h.engine.restored().len(), 1);
    }

    #[tokio::test]
    async fn restore_waits_for_in_flight_operations() {
        let h = harness(HOUR);
        let snapshot = h.snapshot(&h.acme, 1, 0);
        let in_flight = h.locks.shared(&h.acme).unwrap();

        let restore = tokio::spawn({
            let orchestrator = Arc::clone(&h.orchestrator);
            let acme = h.acme.clone();
            async move { orchestrator.restore_to_snapshot(&acme, snapshot.id).await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.locks.state(&h.acme) != TenantLockState::Locking {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.engine.restored().is_empty());

        drop(in_flight);
        restore.await.unwrap().unwrap();
        assert_eq!(h.engine.restored().len(), 1);
    }

    #[tokio::test]
    async fn engine_failure_leaves_tenant_failed_until_cleared() {
        let h = harness(HOUR);
        let snapshot = h.snapshot(&h.acme, 1, 0);
        h.engine.fail_next(1);

        let err = h
            .orchestrator
            .restore_to_snapshot(&h.acme, snapshot.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Failed { .. }));
        assert!(matches!(h.locks.state(&h.acme), TenantLockState::Failed { .. }));
        assert!(matches!(
            h.maintenance(&h.acme).await,
            MaintenanceIndicator::Failed { .. }
        ));
        let status = h.orchestrator.status(&h.acme);
        assert!(matches!(status.events[0].outcome, RestoreOutcome::Failed { .. }));

        // a new restore is refused until an operator steps in
        assert!(matches!(
            h.orchestrator.restore_to_snapshot(&h.acme, snapshot.id).await,
            Err(Error::TenantLocked(_))
        ));
        assert!(h.orchestrator.clear_failed(&h.acme).await.unwrap());
        assert!(!h.orchestrator.clear_failed(&h.acme).await.unwrap());
        assert_eq!(h.maintenance(&h.acme).await, MaintenanceIndicator::None);
        h.orchestrator
            .restore_to_snapshot(&h.acme, snapshot.id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn restore_exceeding_max_duration_fails() {
        let h = harness(Duration::from_millis(50));
        let snapshot = h.snapshot(&h.acme, 1, 0);
        h.engine.pause(&h.acme);

        let err = h
            .orchestrator
            .restore_to_snapshot(&h.acme, snapshot.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut { .. }));
        assert!(matches!(h.locks.state(&h.acme), TenantLockState::Failed { .. }));
    }
}
