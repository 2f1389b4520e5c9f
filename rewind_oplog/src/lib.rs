//! Per-operation change logging and reversal.
//!
//! Every mutation made on behalf of an agent session is recorded by the [`OperationLogger`] in
//! the same transaction as the mutation itself. The [`UndoEngine`] reverses one logged operation
//! at a time without touching anything else in the tenant's database.

pub mod logger;
pub mod mem;
pub mod model;
pub mod store;
pub mod undo;

pub use logger::{LogError, MutationHook, OperationLogger, PendingOperation, PlannedMutation};
pub use mem::MemoryStore;
pub use model::{
    FieldType, FieldValue, InboundReference, ModelSchema, NewOperationLog, OperationLog,
    OperationState, OperationType, RecordSet, RecordValues, SchemaViolation,
};
pub use store::{StoreError, StoreTransaction, TenantStore};
pub use undo::{FieldConflict, UndoEngine, UndoError, UndoOptions, UndoReport, UndoWarning};
