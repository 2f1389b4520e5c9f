//! A [`TenantStore`] kept in memory.
//!
//! Transactions on a tenant are serialised: `begin` waits for the previous transaction on the same
//! tenant to finish, then works on a private copy of the tenant's data that replaces the shared
//! state on commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use iox_time::Time;
use parking_lot::Mutex;
use rewind_id::{OperationLogId, RecordId, TenantId};
use tokio::sync::OwnedMutexGuard;

use crate::model::{
    FieldValue, InboundReference, ModelSchema, NewOperationLog, OperationLog, OperationState,
    RecordSet, RecordValues,
};
use crate::store::{StoreError, StoreTransaction, TenantStore};

#[derive(Debug, Default, Clone)]
struct TenantData {
    schemas: BTreeMap<String, ModelSchema>,
    records: BTreeMap<String, BTreeMap<RecordId, RecordValues>>,
    logs: BTreeMap<OperationLogId, OperationLog>,
    last_log_id: OperationLogId,
}

impl TenantData {
    fn table(&self, model: &str) -> Result<&BTreeMap<RecordId, RecordValues>, StoreError> {
        self.records
            .get(model)
            .ok_or_else(|| StoreError::UnknownModel(model.to_string()))
    }

    fn table_mut(
        &mut self,
        model: &str,
    ) -> Result<&mut BTreeMap<RecordId, RecordValues>, StoreError> {
        self.records
            .get_mut(model)
            .ok_or_else(|| StoreError::UnknownModel(model.to_string()))
    }

    /// `(model, field)` of every relational field pointing at `target`
    fn fields_referencing(&self, target: &str) -> Vec<(String, String)> {
        self.schemas
            .values()
            .flat_map(|schema| {
                schema
                    .references()
                    .filter(|(_, t)| t.target() == Some(target))
                    .map(|(field, _)| (schema.name.clone(), field.to_string()))
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tenants: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<TenantData>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tenant(&self, tenant_id: &TenantId) -> Arc<tokio::sync::Mutex<TenantData>> {
        Arc::clone(self.tenants.lock().entry(tenant_id.clone()).or_default())
    }

    pub async fn register_model(&self, tenant_id: &TenantId, schema: ModelSchema) {
        let tenant = self.tenant(tenant_id);
        let mut data = tenant.lock().await;
        data.records.entry(schema.name.clone()).or_default();
        data.schemas.insert(schema.name.clone(), schema);
    }

    pub async fn record(
        &self,
        tenant_id: &TenantId,
        model: &str,
        id: RecordId,
    ) -> Option<RecordValues> {
        let tenant = self.tenant(tenant_id);
        let data = tenant.lock().await;
        data.records.get(model)?.get(&id).cloned()
    }

    pub async fn record_ids(&self, tenant_id: &TenantId, model: &str) -> Vec<RecordId> {
        let tenant = self.tenant(tenant_id);
        let data = tenant.lock().await;
        data.records
            .get(model)
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn logs(&self, tenant_id: &TenantId) -> Vec<OperationLog> {
        let tenant = self.tenant(tenant_id);
        let data = tenant.lock().await;
        data.logs.values().cloned().collect()
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn begin(&self, tenant_id: &TenantId) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = self.tenant(tenant_id).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            tenant_id: tenant_id.clone(),
            guard,
            working,
        }))
    }
}

#[derive(Debug)]
pub struct MemoryTransaction {
    tenant_id: TenantId,
    guard: OwnedMutexGuard<TenantData>,
    working: TenantData,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    async fn model_schema(&mut self, model: &str) -> Result<ModelSchema, StoreError> {
        self.working
            .schemas
            .get(model)
            .cloned()
            .ok_or_else(|| StoreError::UnknownModel(model.to_string()))
    }

    async fn read(&mut self, model: &str, ids: &[RecordId]) -> Result<RecordSet, StoreError> {
        let table = self.working.table(model)?;
        Ok(ids
            .iter()
            .filter_map(|id| table.get(id).map(|v| (*id, v.clone())))
            .collect())
    }

    async fn exists(&mut self, model: &str, id: RecordId) -> Result<bool, StoreError> {
        Ok(self.working.table(model)?.contains_key(&id))
    }

    async fn create(
        &mut self,
        model: &str,
        id: RecordId,
        values: RecordValues,
    ) -> Result<(), StoreError> {
        let table = self.working.table_mut(model)?;
        if table.contains_key(&id) {
            return Err(StoreError::RecordExists {
                model: model.to_string(),
                id,
            });
        }
        table.insert(id, values);
        Ok(())
    }

    async fn write(
        &mut self,
        model: &str,
        id: RecordId,
        values: &RecordValues,
    ) -> Result<(), StoreError> {
        let record = self
            .working
            .table_mut(model)?
            .get_mut(&id)
            .ok_or_else(|| StoreError::RecordNotFound {
                model: model.to_string(),
                id,
            })?;
        for (field, value) in values {
            record.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete(&mut self, model: &str, id: RecordId) -> Result<(), StoreError> {
        if self.working.table_mut(model)?.remove(&id).is_none() {
            return Err(StoreError::RecordNotFound {
                model: model.to_string(),
                id,
            });
        }
        for (source_model, field) in self.working.fields_referencing(model) {
            let Some(table) = self.working.records.get_mut(&source_model) else {
                continue;
            };
            for record in table.values_mut() {
                match record.get_mut(&field) {
                    Some(FieldValue::ReferenceList(ids)) => ids.retain(|r| *r != id),
                    Some(value) if *value == FieldValue::Reference(id) => *value = FieldValue::Null,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn find_referencing(
        &mut self,
        model: &str,
        ids: &[RecordId],
    ) -> Result<Vec<InboundReference>, StoreError> {
        let mut references = vec![];
        for (source_model, field) in self.working.fields_referencing(model) {
            for (source_id, record) in self.working.table(&source_model)? {
                let targets: Vec<RecordId> = match record.get(&field) {
                    Some(FieldValue::Reference(target)) => vec![*target],
                    Some(FieldValue::ReferenceList(targets)) => targets.clone(),
                    _ => continue,
                };
                for target_id in targets.into_iter().filter(|t| ids.contains(t)) {
                    references.push(InboundReference {
                        model: source_model.clone(),
                        field: field.clone(),
                        source_id: *source_id,
                        target_id,
                    });
                }
            }
        }
        Ok(references)
    }

    async fn insert_log(
        &mut self,
        log: NewOperationLog,
        created_at: Time,
    ) -> Result<OperationLog, StoreError> {
        let id = self.working.last_log_id.next();
        self.working.last_log_id = id;
        let log = OperationLog {
            id,
            session_id: log.session_id,
            tenant_id: self.tenant_id.clone(),
            operation_type: log.operation_type,
            model: log.model,
            record_ids: log.record_ids,
            values_before: log.values_before,
            values_after: log.values_after,
            inbound_references: log.inbound_references,
            state: OperationState::Applied,
            snapshot_id: log.snapshot_id,
            created_at_ns: created_at.timestamp_nanos(),
            undone_at_ns: None,
        };
        self.working.logs.insert(id, log.clone());
        Ok(log)
    }

    async fn get_log(&mut self, id: OperationLogId) -> Result<Option<OperationLog>, StoreError> {
        Ok(self.working.logs.get(&id).cloned())
    }

    async fn mark_log_undone(
        &mut self,
        id: OperationLogId,
        undone_at: Time,
    ) -> Result<(), StoreError> {
        let log = self
            .working
            .logs
            .get_mut(&id)
            .ok_or(StoreError::LogNotFound(id))?;
        log.state = OperationState::Undone;
        log.undone_at_ns = Some(undone_at.timestamp_nanos());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
