//! Persistence of tenant catalogs to object storage.

use std::sync::Arc;

use bytes::Bytes;
use object_store::{ObjectStore, PutPayload};
use observability_deps::tracing::debug;
use rewind_id::TenantId;

use crate::{
    Result,
    paths::CatalogCheckpointPath,
    serialize::{CatalogCheckpoint, serialize_to_file_bytes, verify_file_type_and_deserialize},
};

#[derive(Debug, Clone)]
pub(crate) struct CatalogCheckpointer {
    object_store: Arc<dyn ObjectStore>,
}

impl CatalogCheckpointer {
    pub(crate) fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self { object_store }
    }

    /// Overwrite the tenant's checkpoint with `checkpoint`
    pub(crate) async fn persist(
        &self,
        tenant_id: &TenantId,
        checkpoint: &CatalogCheckpoint,
    ) -> Result<()> {
        let path = CatalogCheckpointPath::new(tenant_id);
        let data = Bytes::from(serialize_to_file_bytes(checkpoint)?);
        let size = data.len();
        self.object_store
            .put(&path, PutPayload::from_bytes(data))
            .await?;
        debug!(tenant = %tenant_id, %path, size, "persisted catalog checkpoint");
        Ok(())
    }

    /// Read the tenant's checkpoint, `None` if none was ever written
    pub(crate) async fn load(&self, tenant_id: &TenantId) -> Result<Option<CatalogCheckpoint>> {
        let path = CatalogCheckpointPath::new(tenant_id);
        let bytes = match self.object_store.get(&path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(verify_file_type_and_deserialize(bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, SnapshotType, WalSegmentRecord};
    use iox_time::Time;
    use object_store::memory::InMemory;
    use pretty_assertions::assert_eq;
    use rewind_id::Lsn;

    #[tokio::test]
    async fn checkpoint_and_reload() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let tenant = TenantId::from("acme");

        let catalog = Catalog::new_with_checkpoints(Arc::clone(&store));
        let tc = catalog.tenant(&tenant);
        let s = tc
            .begin_snapshot(
                SnapshotType::Auto,
                None,
                None,
                Lsn::new(500),
                Time::from_timestamp_nanos(1),
                None,
            )
            .unwrap();
        tc.mark_snapshot_ready(s.id, None, Time::from_timestamp_nanos(2))
            .unwrap();
        tc.add_segment(WalSegmentRecord {
            tenant_id: tenant.clone(),
            segment_name: "000000010000000000000001".into(),
            archive_path: "acme/wal/000000010000000000000001.gz".into(),
            compressed: true,
            size_bytes: 42,
            start_lsn: Lsn::new(0),
            end_lsn: Lsn::new(400),
            archived_at_ns: 3,
        });
        catalog.checkpoint(&tenant).await.unwrap();

        let reloaded = Catalog::new_with_checkpoints(store);
        assert!(reloaded.load(&tenant).await.unwrap());
        let rt = reloaded.tenant(&tenant);
        assert_eq!(rt.list_snapshots(Default::default()), tc.list_snapshots(Default::default()));
        assert_eq!(rt.segments(), tc.segments());

        // id allocation continues where the checkpoint left off
        let next = rt
            .begin_snapshot(
                SnapshotType::Manual,
                None,
                None,
                Lsn::new(600),
                Time::from_timestamp_nanos(4),
                None,
            )
            .unwrap();
        assert_eq!(next.id, s.id.next());
    }

    #[tokio::test]
    async fn queued_checkpoint_writes_latest_state() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let tenant = TenantId::from("acme");
        let catalog = Arc::new(Catalog::new_with_checkpoints(Arc::clone(&store)));
        let tc = catalog.tenant(&tenant);

        // an earlier checkpoint is still being written
        let in_flight = tc.checkpointing.lock().await;
        let queued = tokio::spawn({
            let catalog = Arc::clone(&catalog);
            let tenant = tenant.clone();
            async move { catalog.checkpoint(&tenant).await }
        });
        tc.begin_snapshot(
            SnapshotType::Manual,
            None,
            None,
            Lsn::new(7),
            Time::from_timestamp_nanos(1),
            None,
        )
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!queued.is_finished());

        drop(in_flight);
        queued.await.unwrap().unwrap();
        let reloaded = Catalog::new_with_checkpoints(store);
        assert!(reloaded.load(&tenant).await.unwrap());
        assert_eq!(
            reloaded.tenant(&tenant).list_snapshots(Default::default()),
            tc.list_snapshots(Default::default())
        );
    }

    #[tokio::test]
    async fn missing_checkpoint_is_not_an_error() {
        let catalog = Catalog::new_with_checkpoints(Arc::new(InMemory::new()));
        assert!(!catalog.load(&"nobody".into()).await.unwrap());
        assert!(!Catalog::new().load(&"nobody".into()).await.unwrap());
    }
}
