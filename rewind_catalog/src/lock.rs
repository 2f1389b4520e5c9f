//! Per-tenant access control.
//!
//! Ordinary operations (snapshot creation, undo) take a [`SharedAccess`] for their duration. A
//! restore first claims the tenant with [`TenantLockManager::try_claim_exclusive`], which fails
//! immediately if the tenant is not available, and then waits for outstanding shared access to
//! drain with [`ExclusiveClaim::acquire`]. A restore that fails keeps the tenant locked until an
//! operator calls [`TenantLockManager::clear_failed`].

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use observability_deps::tracing::{info, warn};
use parking_lot::{Mutex, RwLock};
use rewind_id::TenantId;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TenantLockState {
    Available,
    /// A restore has claimed the tenant and waits for in-flight operations to finish
    Locking,
    Restoring,
    Failed { reason: String },
}

impl Display for TenantLockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => f.write_str("available"),
            Self::Locking => f.write_str("locking"),
            Self::Restoring => f.write_str("restoring"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("tenant {tenant_id} is locked ({state})")]
pub struct TenantLockedError {
    pub tenant_id: TenantId,
    pub state: TenantLockState,
}

#[derive(Debug, Default)]
pub struct TenantLockManager {
    slots: RwLock<HashMap<TenantId, Arc<TenantSlot>>>,
}

#[derive(Debug, Default)]
struct TenantSlot {
    access: Arc<tokio::sync::RwLock<()>>,
    state: Mutex<SlotState>,
}

#[derive(Debug)]
struct SlotState {
    state: TenantLockState,
    /// The exclusive guard of a failed restore, held until the failure is cleared
    held: Option<OwnedRwLockWriteGuard<()>>,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            state: TenantLockState::Available,
            held: None,
        }
    }
}

impl TenantLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, tenant_id: &TenantId) -> Arc<TenantSlot> {
        if let Some(slot) = self.slots.read().get(tenant_id) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(tenant_id.clone()).or_default())
    }

    pub fn state(&self, tenant_id: &TenantId) -> TenantLockState {
        self.slot(tenant_id).state.lock().state.clone()
    }

    /// Take shared access to the tenant, failing immediately if a restore holds or has claimed it
    pub fn shared(&self, tenant_id: &TenantId) -> Result<SharedAccess, TenantLockedError> {
        let slot = self.slot(tenant_id);
        let state = slot.state.lock();
        if state.state != TenantLockState::Available {
            return Err(TenantLockedError {
                tenant_id: tenant_id.clone(),
                state: state.state.clone(),
            });
        }
        let guard = Arc::clone(&slot.access)
            .try_read_owned()
            .map_err(|_| TenantLockedError {
                tenant_id: tenant_id.clone(),
                state: state.state.clone(),
            })?;
        Ok(SharedAccess { _guard: guard })
    }

    /// Claim the tenant for a restore. Fails immediately unless the tenant is available.
    pub fn try_claim_exclusive(
        &self,
        tenant_id: &TenantId,
    ) -> Result<ExclusiveClaim, TenantLockedError> {
        let slot = self.slot(tenant_id);
        {
            let mut state = slot.state.lock();
            if state.state != TenantLockState::Available {
                return Err(TenantLockedError {
                    tenant_id: tenant_id.clone(),
                    state: state.state.clone(),
                });
            }
            state.state = TenantLockState::Locking;
        }
        info!(tenant = %tenant_id, "tenant claimed for restore");
        Ok(ExclusiveClaim {
            tenant_id: tenant_id.clone(),
            slot,
            guard: None,
            finished: false,
        })
    }

    /// Unlock a tenant left in the failed state. Returns `false` if the tenant was not failed.
    pub fn clear_failed(&self, tenant_id: &TenantId) -> bool {
        let slot = self.slot(tenant_id);
        let mut state = slot.state.lock();
        if !matches!(state.state, TenantLockState::Failed { .. }) {
            return false;
        }
        state.state = TenantLockState::Available;
        state.held = None;
        info!(tenant = %tenant_id, "failed restore cleared, tenant available");
        true
    }
}

/// Shared access to a tenant; dropping it lets a waiting restore proceed.
#[derive(Debug)]
pub struct SharedAccess {
    _guard: OwnedRwLockReadGuard<()>,
}

/// A restore's claim on a tenant.
///
/// The claim must end with [`ExclusiveClaim::release`] or [`ExclusiveClaim::fail`]. A claim that
/// is dropped without either (for example because the restore task was cancelled) fails the
/// tenant.
#[derive(Debug)]
pub struct ExclusiveClaim {
    tenant_id: TenantId,
    slot: Arc<TenantSlot>,
    guard: Option<OwnedRwLockWriteGuard<()>>,
    finished: bool,
}

impl ExclusiveClaim {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Wait for all shared access to the tenant to be dropped, then hold it exclusively
    pub async fn acquire(&mut self) {
        if self.guard.is_some() {
            return;
        }
        let guard = Arc::clone(&self.slot.access).write_owned().await;
        self.guard = Some(guard);
        self.slot.state.lock().state = TenantLockState::Restoring;
    }

    /// Make the tenant available again
    pub fn release(mut self) {
        self.finished = true;
        let mut state = self.slot.state.lock();
        state.state = TenantLockState::Available;
        state.held = None;
        self.guard = None;
        info!(tenant = %self.tenant_id, "tenant released");
    }

    /// Leave the tenant locked in the failed state
    pub fn fail(mut self, reason: impl Into<String>) {
        self.finished = true;
        let reason = reason.into();
        self.mark_failed(reason);
    }

    fn mark_failed(&mut self, reason: String) {
        warn!(tenant = %self.tenant_id, %reason, "tenant left locked after failed restore");
        let mut state = self.slot.state.lock();
        state.state = TenantLockState::Failed { reason };
        state.held = self.guard.take();
    }
}

impl Drop for ExclusiveClaim {
    fn drop(&mut self) {
        if !self.finished {
            self.mark_failed("restore abandoned before completion".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn claim_blocks_shared_and_other_claims() {
        let locks = TenantLockManager::new();
        let acme: TenantId = "acme".into();
        let other: TenantId = "globex".into();

        let claim = locks.try_claim_exclusive(&acme).unwrap();
        let err = locks.try_claim_exclusive(&acme).unwrap_err();
        assert_eq!(err.state, TenantLockState::Locking);
        assert!(locks.shared(&acme).is_err());

        // other tenants are unaffected
        let _other_claim = locks.try_claim_exclusive(&other).unwrap();

        claim.release();
        assert_eq!(locks.state(&acme), TenantLockState::Available);
        assert!(locks.shared(&acme).is_ok());
    }

    #[tokio::test]
    async fn acquire_waits_for_shared_access() {
        let locks = Arc::new(TenantLockManager::new());
        let acme: TenantId = "acme".into();
        let shared = locks.shared(&acme).unwrap();

        let mut claim = locks.try_claim_exclusive(&acme).unwrap();
        let handle = tokio::spawn(async move {
            claim.acquire().await;
            claim
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        assert_eq!(locks.state(&acme), TenantLockState::Locking);

        drop(shared);
        let claim = handle.await.unwrap();
        assert_eq!(locks.state(&acme), TenantLockState::Restoring);
        claim.release();
    }

    #[tokio::test]
    async fn failure_keeps_tenant_locked_until_cleared() {
        let locks = TenantLockManager::new();
        let acme: TenantId = "acme".into();

        let mut claim = locks.try_claim_exclusive(&acme).unwrap();
        claim.acquire().await;
        claim.fail("replay error");

        assert_eq!(locks.state(&acme), TenantLockState::Failed {
            reason: "replay error".into()
        });
        assert!(locks.shared(&acme).is_err());
        assert!(locks.try_claim_exclusive(&acme).is_err());

        assert!(locks.clear_failed(&acme));
        assert!(!locks.clear_failed(&acme));
        assert!(locks.shared(&acme).is_ok());
    }

    #[test]
    fn dropped_claim_fails_tenant() {
        let locks = TenantLockManager::new();
        let acme: TenantId = "acme".into();
        drop(locks.try_claim_exclusive(&acme).unwrap());
        assert!(matches!(locks.state(&acme), TenantLockState::Failed { .. }));
    }
}
