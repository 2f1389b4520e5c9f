//! In-memory catalog of snapshots, archived WAL segments and restore events.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use ::object_store::ObjectStore;
use iox_time::Time;
use observability_deps::tracing::{debug, info};
use parking_lot::RwLock;
use rewind_id::{Lsn, RestoreEventId, SessionId, SnapshotId, TenantId};
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result, object_store::CatalogCheckpointer, serialize::CatalogCheckpoint,
};

/// Why a snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    /// Requested by an operator
    Manual,
    /// Taken by a schedule
    Auto,
    /// Taken by the mutation layer just before a risky operation
    PreOperation,
}

impl SnapshotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::PreOperation => "pre_operation",
        }
    }
}

impl Display for SnapshotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            "pre_operation" => Ok(Self::PreOperation),
            other => Err(format!(
                "unknown snapshot type {other:?}, expected one of manual, auto, pre_operation"
            )),
        }
    }
}

/// Lifecycle of a snapshot.
///
/// The only legal edges are `creating -> ready`, `creating -> failed` and `ready -> expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Creating,
    Ready,
    Expired,
    Failed,
}

impl SnapshotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Creating, Self::Ready)
                | (Self::Creating, Self::Failed)
                | (Self::Ready, Self::Expired)
        )
    }
}

impl Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "ready" => Ok(Self::Ready),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            other => Err(format!(
                "unknown snapshot state {other:?}, expected one of creating, ready, expired, failed"
            )),
        }
    }
}

/// Metadata describing a recoverable point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub tenant_id: TenantId,
    #[serde(rename = "type")]
    pub snapshot_type: SnapshotType,
    pub state: SnapshotState,
    /// WAL position captured before the engine snapshot started
    pub lsn: Lsn,
    pub label: Option<String>,
    /// Set for pre-operation snapshots
    pub session_id: Option<SessionId>,
    pub created_at_ns: i64,
    pub expires_at_ns: Option<i64>,
    /// Engine-specific location of the snapshot data, known once it is ready
    pub artifact: Option<String>,
    pub failure_reason: Option<String>,
    pub updated_at_ns: i64,
}

impl Snapshot {
    pub fn created_at(&self) -> Time {
        Time::from_timestamp_nanos(self.created_at_ns)
    }

    pub fn expires_at(&self) -> Option<Time> {
        self.expires_at_ns.map(Time::from_timestamp_nanos)
    }
}

/// Descriptor of one archived write-ahead-log segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalSegmentRecord {
    pub tenant_id: TenantId,
    /// The segment's file name as the database produced it
    pub segment_name: Arc<str>,
    pub archive_path: String,
    pub compressed: bool,
    pub size_bytes: u64,
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub archived_at_ns: i64,
}

impl WalSegmentRecord {
    pub fn archived_at(&self) -> Time {
        Time::from_timestamp_nanos(self.archived_at_ns)
    }
}

/// What a restore was asked to reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestoreTarget {
    Snapshot { snapshot_id: SnapshotId },
    Timestamp { timestamp_ns: i64 },
}

impl Display for RestoreTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Snapshot { snapshot_id } => write!(f, "snapshot {snapshot_id}"),
            Self::Timestamp { timestamp_ns } => {
                write!(f, "timestamp {}", Time::from_timestamp_nanos(*timestamp_ns))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RestoreOutcome {
    InProgress,
    Completed,
    Failed { reason: String },
}

/// Audit entry written for every restore attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreEvent {
    pub id: RestoreEventId,
    pub tenant_id: TenantId,
    pub target: RestoreTarget,
    pub base_snapshot_id: Option<SnapshotId>,
    pub started_at_ns: i64,
    pub finished_at_ns: Option<i64>,
    pub outcome: RestoreOutcome,
}

/// Optional filters for [`TenantCatalog::list_snapshots`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFilter {
    #[serde(rename = "type")]
    pub snapshot_type: Option<SnapshotType>,
    pub state: Option<SnapshotState>,
}

impl SnapshotFilter {
    fn matches(&self, snapshot: &Snapshot) -> bool {
        self.snapshot_type
            .is_none_or(|t| t == snapshot.snapshot_type)
            && self.state.is_none_or(|s| s == snapshot.state)
    }
}

/// Storage accounting for one tenant
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantUsage {
    pub ready_snapshots: usize,
    pub archived_segments: usize,
    pub archived_bytes: u64,
}

/// Registry of per-tenant catalogs.
#[derive(Debug, Default)]
pub struct Catalog {
    tenants: RwLock<HashMap<TenantId, Arc<TenantCatalog>>>,
    checkpointer: Option<CatalogCheckpointer>,
}

impl Catalog {
    /// A catalog that lives only in memory
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog that writes each tenant's state to `object_store` on [`Catalog::checkpoint`]
    pub fn new_with_checkpoints(object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            tenants: Default::default(),
            checkpointer: Some(CatalogCheckpointer::new(object_store)),
        }
    }

    /// Get the catalog for `tenant_id`, creating an empty one on first use
    pub fn tenant(&self, tenant_id: &TenantId) -> Arc<TenantCatalog> {
        if let Some(t) = self.tenants.read().get(tenant_id) {
            return Arc::clone(t);
        }
        let mut tenants = self.tenants.write();
        Arc::clone(
            tenants
                .entry(tenant_id.clone())
                .or_insert_with(|| Arc::new(TenantCatalog::new(tenant_id.clone()))),
        )
    }

    pub fn tenant_ids(&self) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self.tenants.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Write the tenant's catalog to object store. This is a no-op for in-memory catalogs.
    pub async fn checkpoint(&self, tenant_id: &TenantId) -> Result<()> {
        let Some(checkpointer) = &self.checkpointer else {
            return Ok(());
        };
        let tenant = self.tenant(tenant_id);
        // the state is read only once earlier checkpoints of the tenant are written, so a slow
        // put can never overwrite a newer checkpoint
        let _persisting = tenant.checkpointing.lock().await;
        let state = tenant.checkpoint_state();
        checkpointer.persist(tenant_id, &state).await
    }

    /// Replace the tenant's in-memory state with its last checkpoint, if there is one.
    ///
    /// Returns `false` when no checkpoint exists or the catalog is in-memory only.
    pub async fn load(&self, tenant_id: &TenantId) -> Result<bool> {
        let Some(checkpointer) = &self.checkpointer else {
            return Ok(false);
        };
        match checkpointer.load(tenant_id).await? {
            Some(checkpoint) => {
                let state = checkpoint.into_inner(tenant_id)?;
                info!(
                    tenant = %tenant_id,
                    snapshots = state.snapshots.len(),
                    segments = state.segments.len(),
                    "loaded catalog checkpoint"
                );
                *self.tenant(tenant_id).inner.write() = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// The catalog of a single tenant.
#[derive(Debug)]
pub struct TenantCatalog {
    tenant_id: TenantId,
    inner: RwLock<InnerTenantCatalog>,
    /// Serialises checkpoints of this tenant
    pub(crate) checkpointing: tokio::sync::Mutex<()>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct InnerTenantCatalog {
    pub(crate) next_snapshot_id: SnapshotId,
    pub(crate) snapshots: BTreeMap<SnapshotId, Snapshot>,
    /// Keyed by segment name; WAL segment names sort in log order
    pub(crate) segments: BTreeMap<Arc<str>, WalSegmentRecord>,
    pub(crate) next_restore_event_id: RestoreEventId,
    pub(crate) restore_events: Vec<RestoreEvent>,
}

impl TenantCatalog {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            inner: RwLock::new(InnerTenantCatalog::default()),
            checkpointing: Default::default(),
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub(crate) fn checkpoint_state(&self) -> CatalogCheckpoint {
        CatalogCheckpoint::new(self.tenant_id.clone(), &self.inner.read())
    }

    /// Insert a new snapshot in the `creating` state.
    ///
    /// Fails if the tenant already has a snapshot in flight.
    pub fn begin_snapshot(
        &self,
        snapshot_type: SnapshotType,
        label: Option<String>,
        session_id: Option<SessionId>,
        lsn: Lsn,
        now: Time,
        expires_at: Option<Time>,
    ) -> Result<Snapshot> {
        let mut inner = self.inner.write();
        if let Some(in_flight) = inner
            .snapshots
            .values()
            .find(|s| s.state == SnapshotState::Creating)
        {
            return Err(Error::SnapshotInFlight {
                tenant_id: self.tenant_id.clone(),
                snapshot_id: in_flight.id,
            });
        }

        let id = inner.next_snapshot_id.next();
        inner.next_snapshot_id = id;
        let snapshot = Snapshot {
            id,
            tenant_id: self.tenant_id.clone(),
            snapshot_type,
            state: SnapshotState::Creating,
            lsn,
            label,
            session_id,
            created_at_ns: now.timestamp_nanos(),
            expires_at_ns: expires_at.map(|t| t.timestamp_nanos()),
            artifact: None,
            failure_reason: None,
            updated_at_ns: now.timestamp_nanos(),
        };
        debug!(tenant = %self.tenant_id, snapshot_id = %id, %lsn, "snapshot creating");
        inner.snapshots.insert(id, snapshot.clone());
        Ok(snapshot)
    }

    pub fn mark_snapshot_ready(
        &self,
        snapshot_id: SnapshotId,
        artifact: Option<String>,
        now: Time,
    ) -> Result<Snapshot> {
        self.transition(snapshot_id, SnapshotState::Ready, now, |s| {
            s.artifact = artifact;
        })
    }

    pub fn mark_snapshot_failed(
        &self,
        snapshot_id: SnapshotId,
        reason: impl Into<String>,
        now: Time,
    ) -> Result<Snapshot> {
        let reason = reason.into();
        self.transition(snapshot_id, SnapshotState::Failed, now, |s| {
            s.failure_reason = Some(reason);
        })
    }

    pub fn expire_snapshot(&self, snapshot_id: SnapshotId, now: Time) -> Result<Snapshot> {
        self.transition(snapshot_id, SnapshotState::Expired, now, |_| {})
    }

    fn transition(
        &self,
        snapshot_id: SnapshotId,
        next: SnapshotState,
        now: Time,
        update: impl FnOnce(&mut Snapshot),
    ) -> Result<Snapshot> {
        let mut inner = self.inner.write();
        let snapshot = inner
            .snapshots
            .get_mut(&snapshot_id)
            .ok_or_else(|| Error::SnapshotNotFound {
                tenant_id: self.tenant_id.clone(),
                snapshot_id,
            })?;
        if !snapshot.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                snapshot_id,
                from: snapshot.state,
                to: next,
            });
        }
        snapshot.state = next;
        snapshot.updated_at_ns = now.timestamp_nanos();
        update(snapshot);
        Ok(snapshot.clone())
    }

    pub fn snapshot(&self, snapshot_id: SnapshotId) -> Option<Snapshot> {
        self.inner.read().snapshots.get(&snapshot_id).cloned()
    }

    /// Snapshots matching `filter`, oldest first
    pub fn list_snapshots(&self, filter: SnapshotFilter) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self
            .inner
            .read()
            .snapshots
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| (s.created_at_ns, s.id));
        snapshots
    }

    /// `ready` snapshots, most recent first
    pub fn ready_snapshots_newest_first(&self) -> Vec<Snapshot> {
        let mut ready = self.list_snapshots(SnapshotFilter {
            state: Some(SnapshotState::Ready),
            ..Default::default()
        });
        ready.reverse();
        ready
    }

    /// Record an archived segment. Returns `false` if a record with the same name already
    /// existed, in which case it is left untouched.
    pub fn add_segment(&self, record: WalSegmentRecord) -> bool {
        let mut inner = self.inner.write();
        if inner.segments.contains_key(&record.segment_name) {
            return false;
        }
        inner
            .segments
            .insert(Arc::clone(&record.segment_name), record);
        true
    }

    pub fn segment(&self, segment_name: &str) -> Option<WalSegmentRecord> {
        self.inner.read().segments.get(segment_name).cloned()
    }

    /// All archived segments in log order
    pub fn segments(&self) -> Vec<WalSegmentRecord> {
        self.inner.read().segments.values().cloned().collect()
    }

    pub fn oldest_segment(&self) -> Option<WalSegmentRecord> {
        self.inner.read().segments.values().next().cloned()
    }

    pub fn remove_segment(&self, segment_name: &str) -> Option<WalSegmentRecord> {
        self.inner.write().segments.remove(segment_name)
    }

    pub fn usage(&self) -> TenantUsage {
        let inner = self.inner.read();
        TenantUsage {
            ready_snapshots: inner
                .snapshots
                .values()
                .filter(|s| s.state == SnapshotState::Ready)
                .count(),
            archived_segments: inner.segments.len(),
            archived_bytes: inner.segments.values().map(|s| s.size_bytes).sum(),
        }
    }

    pub fn record_restore_started(
        &self,
        target: RestoreTarget,
        base_snapshot_id: Option<SnapshotId>,
        now: Time,
    ) -> RestoreEvent {
        let mut inner = self.inner.write();
        let id = inner.next_restore_event_id.next();
        inner.next_restore_event_id = id;
        let event = RestoreEvent {
            id,
            tenant_id: self.tenant_id.clone(),
            target,
            base_snapshot_id,
            started_at_ns: now.timestamp_nanos(),
            finished_at_ns: None,
            outcome: RestoreOutcome::InProgress,
        };
        inner.restore_events.push(event.clone());
        event
    }

    pub fn finish_restore_event(
        &self,
        event_id: RestoreEventId,
        outcome: RestoreOutcome,
        now: Time,
    ) -> Result<RestoreEvent> {
        let mut inner = self.inner.write();
        let event = inner
            .restore_events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| Error::RestoreEventNotFound {
                tenant_id: self.tenant_id.clone(),
                event_id,
            })?;
        event.outcome = outcome;
        event.finished_at_ns = Some(now.timestamp_nanos());
        Ok(event.clone())
    }

    pub fn restore_events(&self) -> Vec<RestoreEvent> {
        self.inner.read().restore_events.clone()
    }
}
