//! Reversal of a single logged operation.
//!
//! An undo runs in one store transaction together with the log's transition to `undone`; either
//! every restoration and the transition commit, or nothing does.

use std::collections::HashSet;
use std::sync::Arc;

use iox_time::TimeProvider;
use observability_deps::tracing::{info, warn};
use rewind_catalog::{TenantLockManager, TenantLockedError};
use rewind_id::{OperationLogId, RecordId, TenantId};
use serde::Serialize;
use thiserror::Error;

use crate::model::{
    FieldValue, InboundReference, ModelSchema, OperationLog, OperationState, OperationType,
    RecordSet, RecordValues, SchemaViolation,
};
use crate::store::{StoreError, StoreTransaction, TenantStore};

#[derive(Debug, Error)]
pub enum UndoError {
    #[error(transparent)]
    TenantLocked(#[from] TenantLockedError),

    #[error("operation log {log_id} not found")]
    LogNotFound { log_id: OperationLogId },

    #[error("operation log {log_id} was already undone")]
    AlreadyUndone {
        log_id: OperationLogId,
        undone_at_ns: Option<i64>,
    },

    #[error(
        "{} field(s) changed since operation {log_id}; undo with force to overwrite them",
        conflicts.len()
    )]
    Conflict {
        log_id: OperationLogId,
        conflicts: Vec<FieldConflict>,
    },

    #[error("{model} record {id} written by operation {log_id} no longer exists")]
    RecordMissing {
        log_id: OperationLogId,
        model: String,
        id: RecordId,
    },

    #[error("operation log {log_id} is malformed: {reason}")]
    MalformedLog {
        log_id: OperationLogId,
        reason: &'static str,
    },

    #[error("restored values do not fit the current schema: {0}")]
    Schema(#[from] SchemaViolation),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UndoOptions {
    /// Undo a write even if the records changed since
    pub force: bool,
}

/// A field whose current value differs from what the operation left behind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldConflict {
    pub record_id: RecordId,
    pub field: String,
    /// The value the operation wrote
    pub expected: FieldValue,
    pub current: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UndoWarning {
    /// A created record had already been deleted by someone else
    RecordAlreadyDeleted { model: String, id: RecordId },
    /// A re-created record pointed at a record that no longer exists; the relation was dropped
    DanglingReference {
        record_id: RecordId,
        field: String,
        target_model: String,
        target_id: RecordId,
    },
    /// A record that pointed at an unlinked record is gone or now points elsewhere
    RelinkSkipped { reference: InboundReference },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UndoReport {
    pub log_id: OperationLogId,
    pub operation_type: OperationType,
    pub model: String,
    /// Records deleted, rewritten or re-created
    pub records: Vec<RecordId>,
    pub warnings: Vec<UndoWarning>,
    /// Values overwritten by a forced undo
    pub overwritten: Vec<FieldConflict>,
}

#[derive(Debug)]
pub struct UndoEngine {
    store: Arc<dyn TenantStore>,
    locks: Arc<TenantLockManager>,
    time_provider: Arc<dyn TimeProvider>,
}

impl UndoEngine {
    pub fn new(
        store: Arc<dyn TenantStore>,
        locks: Arc<TenantLockManager>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            locks,
            time_provider,
        }
    }

    pub async fn undo(
        &self,
        tenant_id: &TenantId,
        log_id: OperationLogId,
        options: UndoOptions,
    ) -> Result<UndoReport, UndoError> {
        let _access = self.locks.shared(tenant_id)?;
        let mut tx = self.store.begin(tenant_id).await?;

        let log = tx
            .get_log(log_id)
            .await?
            .ok_or(UndoError::LogNotFound { log_id })?;
        if log.state != OperationState::Applied {
            return Err(UndoError::AlreadyUndone {
                log_id,
                undone_at_ns: log.undone_at_ns,
            });
        }

        let mut report = UndoReport {
            log_id,
            operation_type: log.operation_type,
            model: log.model.clone(),
            records: vec![],
            warnings: vec![],
            overwritten: vec![],
        };
        match log.operation_type {
            OperationType::Create => undo_create(&mut *tx, &log, &mut report).await?,
            OperationType::Write => undo_write(&mut *tx, &log, options, &mut report).await?,
            OperationType::Unlink => undo_unlink(&mut *tx, &log, &mut report).await?,
        }

        tx.mark_log_undone(log_id, self.time_provider.now()).await?;
        tx.commit().await?;

        for warning in &report.warnings {
            warn!(tenant = %tenant_id, %log_id, ?warning, "undo warning");
        }
        info!(
            tenant = %tenant_id,
            %log_id,
            operation = %log.operation_type,
            model = %log.model,
            n_records = report.records.len(),
            n_overwritten = report.overwritten.len(),
            "operation undone"
        );
        Ok(report)
    }
}

fn required<'a>(
    log: &OperationLog,
    values: &'a Option<RecordSet>,
    reason: &'static str,
) -> Result<&'a RecordSet, UndoError> {
    values.as_ref().ok_or(UndoError::MalformedLog {
        log_id: log.id,
        reason,
    })
}

async fn undo_create(
    tx: &mut dyn StoreTransaction,
    log: &OperationLog,
    report: &mut UndoReport,
) -> Result<(), UndoError> {
    let after = required(log, &log.values_after, "create without values after")?;
    for id in after.keys() {
        if tx.exists(&log.model, *id).await? {
            tx.delete(&log.model, *id).await?;
            report.records.push(*id);
        } else {
            report.warnings.push(UndoWarning::RecordAlreadyDeleted {
                model: log.model.clone(),
                id: *id,
            });
        }
    }
    Ok(())
}

async fn undo_write(
    tx: &mut dyn StoreTransaction,
    log: &OperationLog,
    options: UndoOptions,
    report: &mut UndoReport,
) -> Result<(), UndoError> {
    let before = required(log, &log.values_before, "write without values before")?;
    let after = required(log, &log.values_after, "write without values after")?;
    let ids: Vec<RecordId> = after.keys().copied().collect();
    let current = tx.read(&log.model, &ids).await?;

    let mut conflicts = vec![];
    for (id, written) in after.iter() {
        let Some(current_values) = current.get(id) else {
            return Err(UndoError::RecordMissing {
                log_id: log.id,
                model: log.model.clone(),
                id: *id,
            });
        };
        for (field, expected) in written {
            let now = current_values.get(field).unwrap_or(&FieldValue::Null);
            if now != expected {
                conflicts.push(FieldConflict {
                    record_id: *id,
                    field: field.clone(),
                    expected: expected.clone(),
                    current: now.clone(),
                });
            }
        }
    }
    if !conflicts.is_empty() && !options.force {
        return Err(UndoError::Conflict {
            log_id: log.id,
            conflicts,
        });
    }

    let schema = tx.model_schema(&log.model).await?;
    for (id, written) in after.iter() {
        let prior = before.get(id).ok_or(UndoError::MalformedLog {
            log_id: log.id,
            reason: "written record has no values before",
        })?;
        let restore: RecordValues = written
            .keys()
            .map(|f| (f.clone(), prior.get(f).cloned().unwrap_or(FieldValue::Null)))
            .collect();
        schema.validate(&restore)?;
        tx.write(&log.model, *id, &restore).await?;
        report.records.push(*id);
    }
    report.overwritten = conflicts;
    Ok(())
}

async fn undo_unlink(
    tx: &mut dyn StoreTransaction,
    log: &OperationLog,
    report: &mut UndoReport,
) -> Result<(), UndoError> {
    let before = required(log, &log.values_before, "unlink without values before")?;
    let schema = tx.model_schema(&log.model).await?;
    let recreated: HashSet<RecordId> = before.keys().copied().collect();

    for (id, values) in before.iter() {
        let values =
            drop_dangling(tx, &schema, *id, values.clone(), &recreated, &mut report.warnings)
                .await?;
        schema.validate(&values)?;
        tx.create(&log.model, *id, values).await?;
        report.records.push(*id);
    }

    for reference in &log.inbound_references {
        if !relink(tx, reference).await? {
            report.warnings.push(UndoWarning::RelinkSkipped {
                reference: reference.clone(),
            });
        }
    }
    Ok(())
}

/// Remove relations to records that no longer exist from `values`
async fn drop_dangling(
    tx: &mut dyn StoreTransaction,
    schema: &ModelSchema,
    record_id: RecordId,
    mut values: RecordValues,
    recreated: &HashSet<RecordId>,
    warnings: &mut Vec<UndoWarning>,
) -> Result<RecordValues, UndoError> {
    for (field, field_type) in schema.references() {
        let Some(target_model) = field_type.target() else {
            continue;
        };
        let Some(value) = values.get_mut(field) else {
            continue;
        };
        let targets = match value {
            FieldValue::Reference(target) => vec![*target],
            FieldValue::ReferenceList(targets) => targets.clone(),
            _ => continue,
        };

        let mut dangling = vec![];
        for target in targets {
            let alive = (target_model == schema.name && recreated.contains(&target))
                || tx.exists(target_model, target).await?;
            if !alive {
                dangling.push(target);
                warnings.push(UndoWarning::DanglingReference {
                    record_id,
                    field: field.to_string(),
                    target_model: target_model.to_string(),
                    target_id: target,
                });
            }
        }
        if let FieldValue::ReferenceList(targets) = value {
            targets.retain(|t| !dangling.contains(t));
        } else if !dangling.is_empty() {
            *value = FieldValue::Null;
        }
    }
    Ok(values)
}

/// Point `reference.source_id` back at the re-created record. Returns `false` if the source is
/// gone or a many-to-one relation now points at another record.
async fn relink(
    tx: &mut dyn StoreTransaction,
    reference: &InboundReference,
) -> Result<bool, UndoError> {
    let source = tx.read(&reference.model, &[reference.source_id]).await?;
    let Some(values) = source.get(&reference.source_id) else {
        return Ok(false);
    };
    let update = match values.get(&reference.field) {
        None | Some(FieldValue::Null) => FieldValue::Reference(reference.target_id),
        Some(FieldValue::Reference(t)) if *t == reference.target_id => return Ok(true),
        Some(FieldValue::Reference(_)) => return Ok(false),
        Some(FieldValue::ReferenceList(targets)) => {
            if targets.contains(&reference.target_id) {
                return Ok(true);
            }
            let mut targets = targets.clone();
            targets.push(reference.target_id);
            FieldValue::ReferenceList(targets)
        }
        Some(_) => return Ok(false),
    };
    let update: RecordValues = [(reference.field.clone(), update)].into_iter().collect();
    tx.write(&reference.model, reference.source_id, &update)
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{MutationHook, OperationLogger, PlannedMutation};
    use crate::mem::MemoryStore;
    use crate::model::FieldType;
    use iox_time::{MockProvider, Time};
    use pretty_assertions::assert_eq;

    const LEAD: &str = "crm.lead";
    const TAG: &str = "crm.tag";

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.to_string())
    }

    fn values(pairs: Vec<(&str, FieldValue)>) -> RecordValues {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    struct Harness {
        store: Arc<MemoryStore>,
        tenant: TenantId,
        logger: OperationLogger,
        locks: Arc<TenantLockManager>,
        engine: UndoEngine,
    }

    impl Harness {
        async fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let tenant = TenantId::from("acme");
            store
                .register_model(&tenant, ModelSchema::new(TAG).with_field("name", FieldType::Text))
                .await;
            store
                .register_model(
                    &tenant,
                    ModelSchema::new(LEAD)
                        .with_field("name", FieldType::Text)
                        .with_field("stage", FieldType::Text)
                        .with_field("revenue", FieldType::Float)
                        .with_field("tag_ids", FieldType::ReferenceList {
                            target: TAG.into(),
                        })
                        .with_field("parent_id", FieldType::Reference {
                            target: LEAD.into(),
                        }),
                )
                .await;
            let time: Arc<dyn TimeProvider> =
                Arc::new(MockProvider::new(Time::from_timestamp_nanos(1_000)));
            let locks = Arc::new(TenantLockManager::new());
            let engine = UndoEngine::new(
                Arc::clone(&store) as _,
                Arc::clone(&locks),
                Arc::clone(&time),
            );
            Self {
                store,
                tenant,
                logger: OperationLogger::new(Arc::clone(&locks), time),
                locks,
                engine,
            }
        }

        /// Create records directly, without logging
        async fn seed(&self, model: &str, records: Vec<(u64, RecordValues)>) {
            let mut tx = self.store.begin(&self.tenant).await.unwrap();
            for (id, v) in records {
                tx.create(model, RecordId::new(id), v).await.unwrap();
            }
            tx.commit().await.unwrap();
        }

        fn planned(&self, op: OperationType, ids: &[u64], fields: &[&str]) -> PlannedMutation {
            PlannedMutation {
                session_id: "agent-7".into(),
                operation_type: op,
                model: LEAD.into(),
                record_ids: ids.iter().copied().map(RecordId::new).collect(),
                fields: fields.iter().map(|f| f.to_string()).collect(),
                snapshot_id: None,
            }
        }

        async fn logged_create(&self, records: Vec<(u64, RecordValues)>) -> OperationLogId {
            let mut tx = self.store.begin(&self.tenant).await.unwrap();
            let pending = self
                .logger
                .before_write(&mut *tx, self.planned(OperationType::Create, &[], &[]))
                .await
                .unwrap();
            let mut ids = vec![];
            for (id, v) in records {
                tx.create(LEAD, RecordId::new(id), v).await.unwrap();
                ids.push(RecordId::new(id));
            }
            let log_id = self.logger.after_write(&mut *tx, pending, &ids).await.unwrap();
            tx.commit().await.unwrap();
            log_id
        }

        async fn logged_write(&self, ids: &[u64], update: RecordValues) -> OperationLogId {
            let fields: Vec<&str> = update.keys().map(String::as_str).collect();
            let mut tx = self.store.begin(&self.tenant).await.unwrap();
            let pending = self
                .logger
                .before_write(&mut *tx, self.planned(OperationType::Write, ids, &fields))
                .await
                .unwrap();
            for id in ids {
                tx.write(LEAD, RecordId::new(*id), &update).await.unwrap();
            }
            let log_id = self.logger.after_write(&mut *tx, pending, &[]).await.unwrap();
            tx.commit().await.unwrap();
            log_id
        }

        async fn logged_unlink(&self, ids: &[u64]) -> OperationLogId {
            let mut tx = self.store.begin(&self.tenant).await.unwrap();
            let pending = self
                .logger
                .before_write(&mut *tx, self.planned(OperationType::Unlink, ids, &[]))
                .await
                .unwrap();
            for id in ids {
                tx.delete(LEAD, RecordId::new(*id)).await.unwrap();
            }
            let log_id = self.logger.after_write(&mut *tx, pending, &[]).await.unwrap();
            tx.commit().await.unwrap();
            log_id
        }

        async fn unlogged_write(&self, model: &str, id: u64, update: RecordValues) {
            let mut tx = self.store.begin(&self.tenant).await.unwrap();
            tx.write(model, RecordId::new(id), &update).await.unwrap();
            tx.commit().await.unwrap();
        }

        async fn unlogged_delete(&self, model: &str, id: u64) {
            let mut tx = self.store.begin(&self.tenant).await.unwrap();
            tx.delete(model, RecordId::new(id)).await.unwrap();
            tx.commit().await.unwrap();
        }

        async fn lead(&self, id: u64) -> Option<RecordValues> {
            self.store.record(&self.tenant, LEAD, RecordId::new(id)).await
        }

        async fn log(&self, id: OperationLogId) -> OperationLog {
            self.store
                .logs(&self.tenant)
                .await
                .into_iter()
                .find(|l| l.id == id)
                .unwrap()
        }
    }

    fn lead(name: &str, stage: &str) -> RecordValues {
        values(vec![("name", text(name)), ("stage", text(stage))])
    }

    #[test_log::test(tokio::test)]
    async fn undo_create_deletes_exactly_the_created_records() {
        let h = Harness::new().await;
        h.seed(LEAD, vec![(1, lead("existing", "new"))]).await;
        let log_id = h
            .logged_create(vec![(2, lead("a", "new")), (3, lead("b", "new"))])
            .await;

        let report = h
            .engine
            .undo(&h.tenant, log_id, UndoOptions::default())
            .await
            .unwrap();
        assert_eq!(report.records, vec![RecordId::new(2), RecordId::new(3)]);
        assert_eq!(h.store.record_ids(&h.tenant, LEAD).await, vec![RecordId::new(1)]);
        let log = h.log(log_id).await;
        assert_eq!(log.state, OperationState::Undone);
        assert_eq!(log.undone_at_ns, Some(1_000));

        // the second undo is refused and changes nothing
        h.seed(LEAD, vec![(2, lead("reused id", "new"))]).await;
        let err = h
            .engine
            .undo(&h.tenant, log_id, UndoOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UndoError::AlreadyUndone { undone_at_ns: Some(1_000), .. }));
        assert!(h.lead(2).await.is_some());
    }

    #[tokio::test]
    async fn undo_create_warns_about_already_deleted_records() {
        let h = Harness::new().await;
        let log_id = h
            .logged_create(vec![(2, lead("a", "new")), (3, lead("b", "new"))])
            .await;
        h.unlogged_delete(LEAD, 3).await;

        let report = h
            .engine
            .undo(&h.tenant, log_id, UndoOptions::default())
            .await
            .unwrap();
        assert_eq!(report.records, vec![RecordId::new(2)]);
        assert_eq!(report.warnings, vec![UndoWarning::RecordAlreadyDeleted {
            model: LEAD.into(),
            id: RecordId::new(3)
        }]);
    }

    #[tokio::test]
    async fn undo_write_restores_values_before_exactly() {
        let h = Harness::new().await;
        h.seed(LEAD, vec![(1, lead("acme deal", "new")), (2, lead("other", "won"))])
            .await;
        let original = h.lead(1).await.unwrap();
        let log_id = h
            .logged_write(
                &[1, 2],
                values(vec![("stage", text("lost")), ("revenue", FieldValue::Float(0.0))]),
            )
            .await;

        let report = h
            .engine
            .undo(&h.tenant, log_id, UndoOptions::default())
            .await
            .unwrap();
        assert!(report.overwritten.is_empty());
        // revenue was unset before the write, so it goes back to null
        let mut expected = original;
        expected.insert("revenue".into(), FieldValue::Null);
        assert_eq!(h.lead(1).await.unwrap(), expected);
        assert_eq!(h.lead(2).await.unwrap()["stage"], text("won"));
    }

    #[tokio::test]
    async fn undo_write_refuses_conflicts_unless_forced() {
        let h = Harness::new().await;
        h.seed(LEAD, vec![(1, lead("deal", "new"))]).await;
        let log_id = h.logged_write(&[1], values(vec![("stage", text("won"))])).await;
        // someone else edits the same field, and an unrelated one
        h.unlogged_write(
            LEAD,
            1,
            values(vec![("stage", text("lost")), ("name", text("renamed"))]),
        )
        .await;

        let err = h
            .engine
            .undo(&h.tenant, log_id, UndoOptions::default())
            .await
            .unwrap_err();
        let UndoError::Conflict { conflicts, .. } = err else {
            panic!("expected a conflict, got {err:?}");
        };
        let conflict = FieldConflict {
            record_id: RecordId::new(1),
            field: "stage".into(),
            expected: text("won"),
            current: text("lost"),
        };
        assert_eq!(conflicts, vec![conflict.clone()]);
        assert_eq!(h.lead(1).await.unwrap()["stage"], text("lost"));
        assert_eq!(h.log(log_id).await.state, OperationState::Applied);

        let report = h
            .engine
            .undo(&h.tenant, log_id, UndoOptions { force: true })
            .await
            .unwrap();
        assert_eq!(report.overwritten, vec![conflict]);
        let record = h.lead(1).await.unwrap();
        assert_eq!(record["stage"], text("new"));
        // fields the operation did not write are left alone
        assert_eq!(record["name"], text("renamed"));
    }

    #[tokio::test]
    async fn undo_unlink_recreates_and_relinks() {
        let h = Harness::new().await;
        h.seed(TAG, vec![
            (1, values(vec![("name", text("hot"))])),
            (2, values(vec![("name", text("cold"))])),
        ])
        .await;
        h.seed(LEAD, vec![
            (
                10,
                values(vec![
                    ("name", text("parent")),
                    (
                        "tag_ids",
                        FieldValue::ReferenceList(vec![RecordId::new(1), RecordId::new(2)]),
                    ),
                ]),
            ),
            (
                11,
                values(vec![
                    ("name", text("child")),
                    ("parent_id", FieldValue::Reference(RecordId::new(10))),
                ]),
            ),
            (
                12,
                values(vec![
                    ("name", text("second child")),
                    ("parent_id", FieldValue::Reference(RecordId::new(10))),
                ]),
            ),
        ])
        .await;
        let original = h.lead(10).await.unwrap();

        let log_id = h.logged_unlink(&[10]).await;
        let log = h.log(log_id).await;
        assert_eq!(log.inbound_references.len(), 2);
        assert_eq!(h.lead(11).await.unwrap()["parent_id"], FieldValue::Null);

        // tag 2 disappears and child 12 is deleted in the meantime
        h.unlogged_delete(TAG, 2).await;
        h.unlogged_delete(LEAD, 12).await;

        let report = h
            .engine
            .undo(&h.tenant, log_id, UndoOptions::default())
            .await
            .unwrap();
        assert_eq!(report.records, vec![RecordId::new(10)]);

        let mut expected = original;
        expected.insert(
            "tag_ids".into(),
            FieldValue::ReferenceList(vec![RecordId::new(1)]),
        );
        assert_eq!(h.lead(10).await.unwrap(), expected);
        assert_eq!(
            h.lead(11).await.unwrap()["parent_id"],
            FieldValue::Reference(RecordId::new(10))
        );
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings.contains(&UndoWarning::DanglingReference {
            record_id: RecordId::new(10),
            field: "tag_ids".into(),
            target_model: TAG.into(),
            target_id: RecordId::new(2),
        }));
        assert!(report.warnings.iter().any(|w| matches!(
            w,
            UndoWarning::RelinkSkipped { reference } if reference.source_id == RecordId::new(12)
        )));
    }

    #[tokio::test]
    async fn failed_undo_changes_nothing() {
        let h = Harness::new().await;
        h.seed(LEAD, vec![(1, lead("a", "new")), (2, lead("b", "new"))])
            .await;
        let log_id = h.logged_unlink(&[1, 2]).await;
        // id 2 is taken again, so it cannot be re-created
        h.seed(LEAD, vec![(2, lead("squatter", "new"))]).await;

        let err = h
            .engine
            .undo(&h.tenant, log_id, UndoOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UndoError::Store(StoreError::RecordExists { .. })));
        assert!(h.lead(1).await.is_none());
        assert_eq!(h.log(log_id).await.state, OperationState::Applied);
    }

    #[tokio::test]
    async fn undo_is_refused_while_tenant_is_restoring() {
        let h = Harness::new().await;
        let log_id = h.logged_create(vec![(1, lead("a", "new"))]).await;
        let claim = h.locks.try_claim_exclusive(&h.tenant).unwrap();

        let err = h
            .engine
            .undo(&h.tenant, log_id, UndoOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UndoError::TenantLocked(_)));
        claim.release();

        let missing = h
            .engine
            .undo(&h.tenant, OperationLogId::new(99), UndoOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(missing, UndoError::LogNotFound { .. }));
    }
}
