//! Capture of before/after state for every logged mutation.
//!
//! The mutation layer drives a [`MutationHook`] inside its own transaction:
//!
//! ```text
//! let pending = hook.before_write(&mut *tx, planned).await?;
//! /* perform the create / write / unlink through tx */
//! let log_id = hook.after_write(&mut *tx, pending, &created_ids).await?;
//! tx.commit().await?;
//! ```
//!
//! The log entry is written through the same transaction, so it is rolled back together with the
//! mutation.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use iox_time::TimeProvider;
use observability_deps::tracing::{debug, info};
use rewind_catalog::{SharedAccess, TenantLockManager, TenantLockedError};
use rewind_id::{OperationLogId, RecordId, SessionId, SnapshotId};
use thiserror::Error;

use crate::model::{
    FieldValue, InboundReference, NewOperationLog, OperationType, RecordSet, RecordValues,
};
use crate::store::{StoreError, StoreTransaction};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid operation log: {reason}")]
    InvalidOperationLog { reason: String },

    #[error(transparent)]
    TenantLocked(#[from] TenantLockedError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LogError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperationLog {
            reason: reason.into(),
        }
    }
}

/// A mutation the mutation layer is about to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMutation {
    pub session_id: SessionId,
    pub operation_type: OperationType,
    pub model: String,
    /// Records to be written or unlinked. Ids of created records are passed to
    /// [`MutationHook::after_write`] instead.
    pub record_ids: Vec<RecordId>,
    /// Fields a `write` sets
    pub fields: Vec<String>,
    /// Snapshot taken for this operation by the pre-operation policy
    pub snapshot_id: Option<SnapshotId>,
}

/// State captured by [`MutationHook::before_write`], consumed by [`MutationHook::after_write`].
///
/// Holds shared access to the tenant, so a restore waits for the operation to be logged.
#[derive(Debug)]
pub struct PendingOperation {
    planned: PlannedMutation,
    values_before: Option<RecordSet>,
    inbound_references: Vec<InboundReference>,
    _access: SharedAccess,
}

impl PendingOperation {
    pub fn planned(&self) -> &PlannedMutation {
        &self.planned
    }
}

#[async_trait]
pub trait MutationHook: Debug + Send + Sync + 'static {
    /// Fails with [`LogError::TenantLocked`] while a restore has claimed the tenant
    async fn before_write(
        &self,
        tx: &mut dyn StoreTransaction,
        planned: PlannedMutation,
    ) -> Result<PendingOperation, LogError>;

    /// `created` lists the ids of created records and is ignored for other operations
    async fn after_write(
        &self,
        tx: &mut dyn StoreTransaction,
        pending: PendingOperation,
        created: &[RecordId],
    ) -> Result<OperationLogId, LogError>;
}

#[derive(Debug)]
pub struct OperationLogger {
    locks: Arc<TenantLockManager>,
    time_provider: Arc<dyn TimeProvider>,
}

impl OperationLogger {
    pub fn new(locks: Arc<TenantLockManager>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            locks,
            time_provider,
        }
    }

    /// Write a log entry through `tx` after checking it has the shape its operation type needs
    pub async fn log_operation(
        &self,
        tx: &mut dyn StoreTransaction,
        entry: NewOperationLog,
    ) -> Result<OperationLogId, LogError> {
        validate_shape(&entry)?;
        let log = tx.insert_log(entry, self.time_provider.now()).await?;
        info!(
            tenant = %log.tenant_id,
            session = %log.session_id,
            log_id = %log.id,
            operation = %log.operation_type,
            model = %log.model,
            n_records = log.record_ids.len(),
            "operation logged"
        );
        Ok(log.id)
    }
}

#[async_trait]
impl MutationHook for OperationLogger {
    async fn before_write(
        &self,
        tx: &mut dyn StoreTransaction,
        planned: PlannedMutation,
    ) -> Result<PendingOperation, LogError> {
        let access = self.locks.shared(tx.tenant_id())?;
        let (values_before, inbound_references) = match planned.operation_type {
            OperationType::Create => (None, vec![]),
            OperationType::Write => {
                if planned.fields.is_empty() {
                    return Err(LogError::invalid("a write must name the fields it sets"));
                }
                let mut before = read_all(tx, &planned.model, &planned.record_ids).await?;
                // a field that was never set is captured as null so undo can clear it again
                for values in before.values_mut() {
                    for field in &planned.fields {
                        values.entry(field.clone()).or_insert(FieldValue::Null);
                    }
                }
                (Some(before), vec![])
            }
            OperationType::Unlink => {
                let before = read_all(tx, &planned.model, &planned.record_ids).await?;
                let unlinked: HashSet<RecordId> = planned.record_ids.iter().copied().collect();
                let inbound = tx
                    .find_referencing(&planned.model, &planned.record_ids)
                    .await?
                    .into_iter()
                    // relations among the unlinked records are part of their own values
                    .filter(|r| !(r.model == planned.model && unlinked.contains(&r.source_id)))
                    .collect();
                (Some(before), inbound)
            }
        };
        debug!(
            tenant = %tx.tenant_id(),
            operation = %planned.operation_type,
            model = %planned.model,
            "captured state before write"
        );
        Ok(PendingOperation {
            planned,
            values_before,
            inbound_references,
            _access: access,
        })
    }

    async fn after_write(
        &self,
        tx: &mut dyn StoreTransaction,
        pending: PendingOperation,
        created: &[RecordId],
    ) -> Result<OperationLogId, LogError> {
        let PendingOperation {
            planned,
            values_before,
            inbound_references,
            _access,
        } = pending;

        let (record_ids, values_after) = match planned.operation_type {
            OperationType::Create => {
                let after = read_all(tx, &planned.model, created).await?;
                (created.to_vec(), Some(after))
            }
            OperationType::Write => {
                let current = read_all(tx, &planned.model, &planned.record_ids).await?;
                let after: RecordSet = current
                    .into_iter()
                    .map(|(id, values)| (id, project(&values, &planned.fields)))
                    .collect();
                (planned.record_ids, Some(after))
            }
            OperationType::Unlink => (planned.record_ids, None),
        };

        self.log_operation(
            tx,
            NewOperationLog {
                session_id: planned.session_id,
                operation_type: planned.operation_type,
                model: planned.model,
                record_ids,
                values_before,
                values_after,
                inbound_references,
                snapshot_id: planned.snapshot_id,
            },
        )
        .await
    }
}

/// Read every record in `ids`, failing if one does not exist
async fn read_all(
    tx: &mut dyn StoreTransaction,
    model: &str,
    ids: &[RecordId],
) -> Result<RecordSet, LogError> {
    let records = tx.read(model, ids).await?;
    if let Some(missing) = ids.iter().find(|id| !records.contains_key(*id)) {
        return Err(StoreError::RecordNotFound {
            model: model.to_string(),
            id: *missing,
        }
        .into());
    }
    Ok(records)
}

fn project(values: &RecordValues, fields: &[String]) -> RecordValues {
    fields
        .iter()
        .map(|f| (f.clone(), values.get(f).cloned().unwrap_or(FieldValue::Null)))
        .collect()
}

fn validate_shape(entry: &NewOperationLog) -> Result<(), LogError> {
    if entry.record_ids.is_empty() {
        return Err(LogError::invalid("no record ids"));
    }
    let ids: HashSet<RecordId> = entry.record_ids.iter().copied().collect();
    if ids.len() != entry.record_ids.len() {
        return Err(LogError::invalid("duplicate record ids"));
    }

    let covers_ids = |set: &RecordSet| set.len() == ids.len() && set.keys().all(|k| ids.contains(k));
    let op = entry.operation_type;
    match (op, &entry.values_before, &entry.values_after) {
        (OperationType::Create, None, Some(after)) if covers_ids(after) => {}
        (OperationType::Write, Some(before), Some(after))
            if covers_ids(before) && covers_ids(after) =>
        {
            for (id, after_values) in after.iter() {
                let before_values = &before[id];
                if let Some(field) = after_values.keys().find(|f| !before_values.contains_key(*f)) {
                    return Err(LogError::invalid(format!(
                        "prior value of field {field} of record {id} was not captured"
                    )));
                }
            }
        }
        (OperationType::Unlink, Some(before), None) if covers_ids(before) => {}
        _ => {
            return Err(LogError::invalid(format!(
                "{op} needs {} for exactly the affected records",
                match op {
                    OperationType::Create => "values after and no values before",
                    OperationType::Write => "values before and after",
                    OperationType::Unlink => "values before and no values after",
                }
            )));
        }
    }

    if op != OperationType::Unlink && !entry.inbound_references.is_empty() {
        return Err(LogError::invalid(format!("{op} cannot carry inbound references")));
    }
    Ok(())
}
