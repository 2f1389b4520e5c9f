//! The per-tenant archive loop.

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use iox_time::{Time, TimeProvider};
use object_store::{ObjectStore, PutPayload};
use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use rewind_catalog::{Catalog, WalSegmentRecord, paths::ArchivedSegmentPath};
use rewind_id::TenantId;
use rewind_shutdown::ShutdownToken;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{
    ArchiverConfig, Error, Result,
    alert::{AlertSink, ArchiveAlert},
    segment::{WalSegment, compress},
    source::WalSource,
};

#[derive(Debug)]
pub struct WalArchiverArgs {
    pub tenant_id: TenantId,
    pub source: Arc<dyn WalSource>,
    pub object_store: Arc<dyn ObjectStore>,
    pub catalog: Arc<Catalog>,
    pub alerts: Arc<dyn AlertSink>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub config: ArchiverConfig,
}

#[derive(Debug)]
pub struct WalArchiver {
    tenant_id: TenantId,
    source: Arc<dyn WalSource>,
    object_store: Arc<dyn ObjectStore>,
    catalog: Arc<Catalog>,
    alerts: Arc<dyn AlertSink>,
    time_provider: Arc<dyn TimeProvider>,
    config: ArchiverConfig,
    /// Last time a segment was archived or a switch was requested
    last_activity: Mutex<Time>,
}

impl WalArchiver {
    pub fn new(
        WalArchiverArgs {
            tenant_id,
            source,
            object_store,
            catalog,
            alerts,
            time_provider,
            config,
        }: WalArchiverArgs,
    ) -> Self {
        let now = time_provider.now();
        Self {
            tenant_id,
            source,
            object_store,
            catalog,
            alerts,
            time_provider,
            config,
            last_activity: Mutex::new(now),
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Run the archive loop on its own task until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: ShutdownToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(&self, shutdown: ShutdownToken) {
        info!(tenant = %self.tenant_id, "WAL archiver started");
        match self.reconcile().await {
            Ok(0) => (),
            Ok(n) => info!(tenant = %self.tenant_id, n, "recovered archived segment records"),
            Err(e) => warn!(tenant = %self.tenant_id, %e, "failed to reconcile WAL archive"),
        }

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.tick(&shutdown).await {
                error!(tenant = %self.tenant_id, %e, "WAL archiving pass failed");
            }
        }

        info!(tenant = %self.tenant_id, "WAL archiver stopped");
        shutdown.complete();
    }

    /// Archive whatever is ready, forcing a segment switch if the archive timeout has elapsed
    pub async fn tick(&self, shutdown: &ShutdownToken) -> Result<usize> {
        let mut archived = self.archive_pending(shutdown).await?;
        let now = self.time_provider.now();
        if archived > 0 {
            *self.last_activity.lock() = now;
            return Ok(archived);
        }

        let idle = now
            .checked_duration_since(*self.last_activity.lock())
            .unwrap_or_default();
        if idle >= self.config.archive_timeout {
            *self.last_activity.lock() = now;
            if self.source.switch_segment().await.map_err(Error::Switch)? {
                debug!(tenant = %self.tenant_id, ?idle, "archive timeout reached, segment switched");
                archived += self.archive_pending(shutdown).await?;
            }
        }
        Ok(archived)
    }

    /// Archive every ready segment in log order, stopping at the first one that fails
    pub async fn archive_pending(&self, shutdown: &ShutdownToken) -> Result<usize> {
        let segments = self
            .source
            .ready_segments()
            .await
            .map_err(Error::ListSegments)?;
        let mut archived = 0;
        for segment in segments {
            if shutdown.is_shutdown() {
                break;
            }
            self.archive_segment(&segment, shutdown).await?;
            archived += 1;
        }
        Ok(archived)
    }

    async fn archive_segment(
        &self,
        segment: &WalSegment,
        shutdown: &ShutdownToken,
    ) -> Result<WalSegmentRecord> {
        let raw = self
            .source
            .read_segment(segment)
            .await
            .map_err(|source| Error::ReadSegment {
                segment: Arc::clone(&segment.name),
                source,
            })?;
        let compressed = compress(&raw).map_err(|source| Error::Compress {
            segment: Arc::clone(&segment.name),
            source,
        })?;

        let path = ArchivedSegmentPath::new(&self.tenant_id, &segment.name);
        let size_bytes = compressed.len() as u64;
        self.put_with_retry(&path, Bytes::from(compressed), segment, shutdown)
            .await?;

        let record = WalSegmentRecord {
            tenant_id: self.tenant_id.clone(),
            segment_name: Arc::clone(&segment.name),
            archive_path: path.to_string(),
            compressed: true,
            size_bytes,
            start_lsn: segment.start_lsn,
            end_lsn: segment.end_lsn,
            archived_at_ns: self.time_provider.now().timestamp_nanos(),
        };
        if !self.catalog.tenant(&self.tenant_id).add_segment(record.clone()) {
            debug!(tenant = %self.tenant_id, segment = %segment.name, "segment was already recorded");
        }
        if let Err(e) = self.catalog.checkpoint(&self.tenant_id).await {
            warn!(tenant = %self.tenant_id, %e, "failed to checkpoint catalog after archiving");
        }

        self.source
            .acknowledge(segment)
            .await
            .map_err(|source| Error::Acknowledge {
                segment: Arc::clone(&segment.name),
                source,
            })?;
        info!(
            tenant = %self.tenant_id,
            segment = %segment.name,
            raw_bytes = raw.len(),
            size_bytes,
            end_lsn = %segment.end_lsn,
            "archived WAL segment"
        );
        Ok(record)
    }

    /// Keep trying to put the segment until it succeeds or the archiver is shut down
    async fn put_with_retry(
        &self,
        path: &ArchivedSegmentPath,
        data: Bytes,
        segment: &WalSegment,
        shutdown: &ShutdownToken,
    ) -> Result<()> {
        let alert_every = self.config.alert_after_attempts.max(1);
        let mut attempts = 0u32;
        let mut first_failure_at: Option<Time> = None;
        loop {
            match self
                .object_store
                .put(path, PutPayload::from_bytes(data.clone()))
                .await
            {
                Ok(_) => {
                    if attempts > 0 {
                        info!(
                            tenant = %self.tenant_id,
                            segment = %segment.name,
                            attempts,
                            "WAL segment archived after retries"
                        );
                    }
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    let first = *first_failure_at.get_or_insert_with(|| self.time_provider.now());
                    error!(
                        tenant = %self.tenant_id,
                        segment = %segment.name,
                        attempts,
                        %e,
                        "error writing WAL segment to archive storage"
                    );
                    if attempts % alert_every == 0 {
                        self.alerts.alert(ArchiveAlert {
                            tenant_id: self.tenant_id.clone(),
                            segment_name: Arc::clone(&segment.name),
                            attempts,
                            last_error: e.to_string(),
                            first_failure_at_ns: first.timestamp_nanos(),
                        });
                    }

                    let delay = self.config.backoff(attempts);
                    tokio::select! {
                        _ = shutdown.wait_for_shutdown() => {
                            return Err(Error::Archive {
                                segment: Arc::clone(&segment.name),
                                attempts,
                                source: e,
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Restore catalog records for segments present in archive storage but missing from the
    /// catalog, e.g. after a crash between the put and the catalog write. Returns how many
    /// records were added.
    pub async fn reconcile(&self) -> Result<usize> {
        let prefix = ArchivedSegmentPath::dir(&self.tenant_id);
        let objects: Vec<_> = self
            .object_store
            .list(Some(&*prefix))
            .try_collect()
            .await?;

        let catalog = self.catalog.tenant(&self.tenant_id);
        let mut added = 0;
        for meta in objects {
            let Some(name) = ArchivedSegmentPath::segment_name(&meta.location) else {
                continue;
            };
            if catalog.segment(name).is_some() {
                continue;
            }
            let Some(segment) = WalSegment::from_name(name, self.config.segment_size) else {
                warn!(tenant = %self.tenant_id, location = %meta.location, "unexpected object in WAL archive");
                continue;
            };
            catalog.add_segment(WalSegmentRecord {
                tenant_id: self.tenant_id.clone(),
                segment_name: segment.name,
                archive_path: meta.location.to_string(),
                compressed: true,
                size_bytes: meta.size as u64,
                start_lsn: segment.start_lsn,
                end_lsn: segment.end_lsn,
                archived_at_ns: Time::from_datetime(meta.last_modified).timestamp_nanos(),
            });
            added += 1;
        }
        if added > 0 {
            if let Err(e) = self.catalog.checkpoint(&self.tenant_id).await {
                warn!(tenant = %self.tenant_id, %e, "failed to checkpoint catalog after reconcile");
            }
        }
        Ok(added)
    }
}
