//! Serialization of a tenant catalog checkpoint. A checkpoint is written to object store in a
//! single PUT, prefixed with a file type identifier and a crc32 checksum of the JSON body.

use std::mem::size_of;

use bytes::Bytes;
use rewind_id::{RestoreEventId, SnapshotId, TenantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{InnerTenantCatalog, RestoreEvent, Snapshot, WalSegmentRecord};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid catalog checkpoint file identifier")]
    InvalidCheckpointFile,

    #[error("catalog checkpoint is truncated")]
    Truncated,

    #[error("crc32 checksum mismatch")]
    Crc32Mismatch,

    #[error("checkpoint belongs to tenant {found}, expected {expected}")]
    TenantMismatch { expected: TenantId, found: TenantId },

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// The first bytes written into a checkpoint file to identify it and its version.
const FILE_TYPE_IDENTIFIER: &[u8] = b"rwnd.001";

const CHECKSUM_LEN: usize = size_of::<u32>();

/// The persisted form of one tenant's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CatalogCheckpoint {
    tenant_id: TenantId,
    next_snapshot_id: SnapshotId,
    snapshots: Vec<Snapshot>,
    segments: Vec<WalSegmentRecord>,
    next_restore_event_id: RestoreEventId,
    restore_events: Vec<RestoreEvent>,
}

impl CatalogCheckpoint {
    pub(crate) fn new(tenant_id: TenantId, inner: &InnerTenantCatalog) -> Self {
        Self {
            tenant_id,
            next_snapshot_id: inner.next_snapshot_id,
            snapshots: inner.snapshots.values().cloned().collect(),
            segments: inner.segments.values().cloned().collect(),
            next_restore_event_id: inner.next_restore_event_id,
            restore_events: inner.restore_events.clone(),
        }
    }

    pub(crate) fn into_inner(self, expected: &TenantId) -> Result<InnerTenantCatalog> {
        if &self.tenant_id != expected {
            return Err(Error::TenantMismatch {
                expected: expected.clone(),
                found: self.tenant_id,
            });
        }
        Ok(InnerTenantCatalog {
            next_snapshot_id: self.next_snapshot_id,
            snapshots: self.snapshots.into_iter().map(|s| (s.id, s)).collect(),
            segments: self
                .segments
                .into_iter()
                .map(|s| (std::sync::Arc::clone(&s.segment_name), s))
                .collect(),
            next_restore_event_id: self.next_restore_event_id,
            restore_events: self.restore_events,
        })
    }
}

pub(crate) fn verify_file_type_and_deserialize(b: Bytes) -> Result<CatalogCheckpoint> {
    let pos = FILE_TYPE_IDENTIFIER.len();
    if b.len() < pos + CHECKSUM_LEN {
        return Err(Error::Truncated);
    }

    if &b[..pos] != FILE_TYPE_IDENTIFIER {
        return Err(Error::InvalidCheckpointFile);
    }

    let mut checksum_bytes = [0u8; CHECKSUM_LEN];
    checksum_bytes.copy_from_slice(&b[pos..pos + CHECKSUM_LEN]);
    let crc32_checksum = u32::from_be_bytes(checksum_bytes);

    let data = &b[pos + CHECKSUM_LEN..];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    if hasher.finalize() != crc32_checksum {
        return Err(Error::Crc32Mismatch);
    }

    Ok(serde_json::from_slice(data)?)
}

pub(crate) fn serialize_to_file_bytes(checkpoint: &CatalogCheckpoint) -> Result<Vec<u8>> {
    let data = serde_json::to_vec(checkpoint)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data);
    let checksum = hasher.finalize();

    let mut buf = Vec::with_capacity(FILE_TYPE_IDENTIFIER.len() + CHECKSUM_LEN + data.len());
    buf.extend_from_slice(FILE_TYPE_IDENTIFIER);
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(&data);

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{SnapshotType, TenantCatalog};
    use iox_time::Time;
    use pretty_assertions::assert_eq;
    use rewind_id::Lsn;

    fn checkpoint() -> CatalogCheckpoint {
        let catalog = TenantCatalog::new("acme".into());
        let s = catalog
            .begin_snapshot(
                SnapshotType::Manual,
                Some("before import".into()),
                None,
                Lsn::new(77),
                Time::from_timestamp_nanos(10),
                None,
            )
            .unwrap();
        catalog
            .mark_snapshot_ready(s.id, Some("snap-1".into()), Time::from_timestamp_nanos(20))
            .unwrap();
        catalog.checkpoint_state()
    }

    #[test]
    fn serialize_then_verify() {
        let cp = checkpoint();
        let bytes = serialize_to_file_bytes(&cp).unwrap();
        assert_eq!(&bytes[..8], b"rwnd.001");
        let back = verify_file_type_and_deserialize(Bytes::from(bytes)).unwrap();
        assert_eq!(back, cp);
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let mut bytes = serialize_to_file_bytes(&checkpoint()).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            verify_file_type_and_deserialize(Bytes::from(bytes)),
            Err(Error::Crc32Mismatch)
        ));
    }

    #[test]
    fn rejects_foreign_and_short_files() {
        assert!(matches!(
            verify_file_type_and_deserialize(Bytes::from_static(b"idb3.001\0\0\0\0{}")),
            Err(Error::InvalidCheckpointFile)
        ));
        assert!(matches!(
            verify_file_type_and_deserialize(Bytes::from_static(b"rwnd")),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn tenant_must_match() {
        let err = checkpoint().into_inner(&"other".into()).unwrap_err();
        assert!(matches!(err, Error::TenantMismatch { .. }));
    }
}
