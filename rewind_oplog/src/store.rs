//! The transactional record store of a tenant, as seen by the logger and the undo engine.

use std::fmt::Debug;

use async_trait::async_trait;
use iox_time::Time;
use rewind_id::{OperationLogId, RecordId, TenantId};
use thiserror::Error;

use crate::model::{
    InboundReference, ModelSchema, NewOperationLog, OperationLog, RecordSet, RecordValues,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown model {0}")]
    UnknownModel(String),

    #[error("{model} record {id} not found")]
    RecordNotFound { model: String, id: RecordId },

    #[error("{model} record {id} already exists")]
    RecordExists { model: String, id: RecordId },

    #[error("operation log {0} not found")]
    LogNotFound(OperationLogId),

    #[error("store error: {0}")]
    Unexpected(#[from] anyhow::Error),
}

/// Opens transactions against tenants' databases
#[async_trait]
pub trait TenantStore: Debug + Send + Sync + 'static {
    async fn begin(&self, tenant_id: &TenantId) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// One database transaction.
///
/// Nothing is visible to other transactions until [`commit`][StoreTransaction::commit]. Dropping
/// a transaction without committing rolls it back.
#[async_trait]
pub trait StoreTransaction: Debug + Send {
    fn tenant_id(&self) -> &TenantId;

    async fn model_schema(&mut self, model: &str) -> Result<ModelSchema, StoreError>;

    /// Current values of the given records. Records that do not exist are left out.
    async fn read(&mut self, model: &str, ids: &[RecordId]) -> Result<RecordSet, StoreError>;

    async fn exists(&mut self, model: &str, id: RecordId) -> Result<bool, StoreError>;

    /// Insert a record under an explicit id
    async fn create(
        &mut self,
        model: &str,
        id: RecordId,
        values: RecordValues,
    ) -> Result<(), StoreError>;

    /// Update the given fields of an existing record, leaving the others as they are
    async fn write(
        &mut self,
        model: &str,
        id: RecordId,
        values: &RecordValues,
    ) -> Result<(), StoreError>;

    /// Delete a record. Relations other records hold to it are cleared.
    async fn delete(&mut self, model: &str, id: RecordId) -> Result<(), StoreError>;

    /// Relations from records of any model to the given records of `model`
    async fn find_referencing(
        &mut self,
        model: &str,
        ids: &[RecordId],
    ) -> Result<Vec<InboundReference>, StoreError>;

    async fn insert_log(
        &mut self,
        log: NewOperationLog,
        created_at: Time,
    ) -> Result<OperationLog, StoreError>;

    async fn get_log(&mut self, id: OperationLogId) -> Result<Option<OperationLog>, StoreError>;

    async fn mark_log_undone(
        &mut self,
        id: OperationLogId,
        undone_at: Time,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
