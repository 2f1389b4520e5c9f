//! The database-engine side of taking a snapshot.

use std::collections::HashMap;
use std::fmt::Debug;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use rewind_id::{Lsn, SnapshotId, TenantId};
use tokio::sync::watch;

#[async_trait]
pub trait SnapshotEngine: Debug + Send + Sync + 'static {
    /// The tenant's current WAL write position
    async fn current_lsn(&self, tenant_id: &TenantId) -> anyhow::Result<Lsn>;

    /// Take a snapshot consistent with `lsn` without blocking the tenant's reads and writes.
    /// Returns where the engine keeps it.
    async fn take_snapshot(
        &self,
        tenant_id: &TenantId,
        snapshot_id: SnapshotId,
        lsn: Lsn,
    ) -> anyhow::Result<String>;

    /// Free whatever the engine holds for an expired snapshot
    async fn release_snapshot(&self, tenant_id: &TenantId, artifact: &str) -> anyhow::Result<()>;
}

/// A [`SnapshotEngine`] that only keeps track of what it was asked to do
#[derive(Debug)]
pub struct MemorySnapshotEngine {
    state: Mutex<MemoryEngineState>,
    paused: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct MemoryEngineState {
    lsns: HashMap<TenantId, Lsn>,
    failing: u32,
    artifacts: Vec<String>,
    released: Vec<String>,
}

impl Default for MemorySnapshotEngine {
    fn default() -> Self {
        Self {
            state: Default::default(),
            paused: watch::Sender::new(false),
        }
    }
}

impl MemorySnapshotEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_lsn(&self, tenant_id: &TenantId, lsn: Lsn) {
        self.state.lock().lsns.insert(tenant_id.clone(), lsn);
    }

    /// Make the next `n` snapshots fail
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failing = n;
    }

    /// Hold every snapshot in progress until [`resume`](Self::resume)
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn artifacts(&self) -> Vec<String> {
        self.state.lock().artifacts.clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.state.lock().released.clone()
    }
}

#[async_trait]
impl SnapshotEngine for MemorySnapshotEngine {
    async fn current_lsn(&self, tenant_id: &TenantId) -> anyhow::Result<Lsn> {
        Ok(self
            .state
            .lock()
            .lsns
            .get(tenant_id)
            .copied()
            .unwrap_or_default())
    }

    async fn take_snapshot(
        &self,
        tenant_id: &TenantId,
        snapshot_id: SnapshotId,
        lsn: Lsn,
    ) -> anyhow::Result<String> {
        let mut paused = self.paused.subscribe();
        paused
            .wait_for(|p| !*p)
            .await
            .map_err(|_| anyhow!("snapshot engine went away"))?;

        let mut state = self.state.lock();
        if state.failing > 0 {
            state.failing -= 1;
            bail!("engine refused snapshot {snapshot_id} of {tenant_id}");
        }
        let artifact = format!("mem://{tenant_id}/snapshots/{snapshot_id}@{lsn}");
        state.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    async fn release_snapshot(&self, _tenant_id: &TenantId, artifact: &str) -> anyhow::Result<()> {
        self.state.lock().released.push(artifact.to_string());
        Ok(())
    }
}
