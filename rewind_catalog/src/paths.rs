use object_store::path::Path as ObjPath;
use rewind_id::TenantId;
use std::ops::Deref;

/// File extension for archived, gzip-compressed WAL segments
pub const ARCHIVED_SEGMENT_EXTENSION: &str = "gz";

/// File name of a tenant's catalog checkpoint
pub const CATALOG_CHECKPOINT_FILE: &str = "checkpoint.catalog";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedSegmentPath(ObjPath);

impl ArchivedSegmentPath {
    pub fn new(tenant_id: &TenantId, segment_name: &str) -> Self {
        Self(ObjPath::from(format!(
            "{tenant_id}/wal/{segment_name}.{ARCHIVED_SEGMENT_EXTENSION}"
        )))
    }

    /// The prefix every archived segment of `tenant_id` lives under
    pub fn dir(tenant_id: &TenantId) -> Self {
        Self(ObjPath::from(format!("{tenant_id}/wal")))
    }

    /// Recover the original segment name from an archived object's location, if it is one
    pub fn segment_name(location: &ObjPath) -> Option<&str> {
        location
            .filename()?
            .strip_suffix(ARCHIVED_SEGMENT_EXTENSION)?
            .strip_suffix('.')
    }
}

impl Deref for ArchivedSegmentPath {
    type Target = ObjPath;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<ObjPath> for ArchivedSegmentPath {
    fn as_ref(&self) -> &ObjPath {
        &self.0
    }
}

impl std::fmt::Display for ArchivedSegmentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogCheckpointPath(ObjPath);

impl CatalogCheckpointPath {
    pub fn new(tenant_id: &TenantId) -> Self {
        Self(ObjPath::from(format!(
            "{tenant_id}/catalog/{CATALOG_CHECKPOINT_FILE}"
        )))
    }
}

impl Deref for CatalogCheckpointPath {
    type Target = ObjPath;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<ObjPath> for CatalogCheckpointPath {
    fn as_ref(&self) -> &ObjPath {
        &self.0
    }
}

impl std::fmt::Display for CatalogCheckpointPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

#[test]
fn archived_segment_path_new() {
    let tenant = TenantId::from("acme");
    let path = ArchivedSegmentPath::new(&tenant, "000000010000000000000003");
    assert_eq!(
        *path,
        ObjPath::from("acme/wal/000000010000000000000003.gz")
    );
    assert_eq!(
        ArchivedSegmentPath::segment_name(&path),
        Some("000000010000000000000003")
    );
    assert_eq!(
        ArchivedSegmentPath::segment_name(&ObjPath::from("acme/wal/README")),
        None
    );
    assert_eq!(*ArchivedSegmentPath::dir(&tenant), ObjPath::from("acme/wal"));
}

#[test]
fn catalog_checkpoint_path_new() {
    assert_eq!(
        *CatalogCheckpointPath::new(&"acme".into()),
        ObjPath::from("acme/catalog/checkpoint.catalog")
    );
}
