//! The database-engine side of a restore.

use std::collections::HashSet;
use std::fmt::Debug;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use iox_time::Time;
use parking_lot::Mutex;
use rewind_catalog::{RestoreTarget, Snapshot, WalSegmentRecord};
use rewind_id::TenantId;
use serde::Serialize;
use tokio::sync::watch;

/// Everything an engine needs to bring a tenant back to a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestorePlan {
    pub tenant_id: TenantId,
    pub target: RestoreTarget,
    /// Restored first
    pub base_snapshot: Snapshot,
    /// Archived WAL to replay on top of the base, in log order
    pub segments: Vec<WalSegmentRecord>,
    /// Replay stops at this time. Without one the base snapshot is restored as it is.
    #[serde(skip)]
    pub recovery_target_time: Option<Time>,
}

#[async_trait]
pub trait RestoreEngine: Debug + Send + Sync + 'static {
    /// Replace the tenant's database with the state described by `plan`
    async fn restore(&self, plan: &RestorePlan) -> anyhow::Result<()>;
}

/// A [`RestoreEngine`] that records plans instead of restoring anything
#[derive(Debug)]
pub struct MemoryRestoreEngine {
    state: Mutex<MemoryRestoreState>,
    paused: watch::Sender<HashSet<TenantId>>,
}

#[derive(Debug, Default)]
struct MemoryRestoreState {
    failing: u32,
    restored: Vec<RestorePlan>,
}

impl Default for MemoryRestoreEngine {
    fn default() -> Self {
        Self {
            state: Default::default(),
            paused: watch::Sender::new(HashSet::new()),
        }
    }
}

impl MemoryRestoreEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` restores fail
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failing = n;
    }

    /// Hold restores of the tenant until [`resume`](Self::resume)
    pub fn pause(&self, tenant_id: &TenantId) {
        self.paused.send_modify(|p| {
            p.insert(tenant_id.clone());
        });
    }

    pub fn resume(&self, tenant_id: &TenantId) {
        self.paused.send_modify(|p| {
            p.remove(tenant_id);
        });
    }

    /// Plans of completed restores
    pub fn restored(&self) -> Vec<RestorePlan> {
        self.state.lock().restored.clone()
    }
}

#[async_trait]
impl RestoreEngine for MemoryRestoreEngine {
    async fn restore(&self, plan: &RestorePlan) -> anyhow::Result<()> {
        let mut paused = self.paused.subscribe();
        paused
            .wait_for(|p| !p.contains(&plan.tenant_id))
            .await
            .map_err(|_| anyhow!("restore engine went away"))?;

        let mut state = self.state.lock();
        if state.failing > 0 {
            state.failing -= 1;
            bail!("base backup of snapshot {} is unreadable", plan.base_snapshot.id);
        }
        state.restored.push(plan.clone());
        Ok(())
    }
}
