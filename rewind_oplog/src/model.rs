//! Records, their schemas, and the operation log entry describing a mutation of them.

use std::fmt::Display;

use indexmap::IndexMap;
use iox_time::Time;
use rewind_id::{OperationLogId, RecordId, SerdeVecMap, SessionId, SnapshotId, TenantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single field value, tagged with its type so it survives serialization unchanged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    /// Nanoseconds since the epoch
    Timestamp(i64),
    /// Many-to-one relation
    Reference(RecordId),
    /// Many-to-many relation
    ReferenceList(Vec<RecordId>),
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Timestamp(_) => "timestamp",
            Self::Reference(_) => "reference",
            Self::ReferenceList(_) => "reference_list",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Field values of one record, in field order
pub type RecordValues = IndexMap<String, FieldValue>;

/// Field values of several records of one model, in the order they were affected
pub type RecordSet = SerdeVecMap<RecordId, RecordValues>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Integer,
    Float,
    Text,
    Timestamp,
    Reference { target: String },
    ReferenceList { target: String },
}

impl FieldType {
    fn accepts(&self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (_, FieldValue::Null)
                | (Self::Bool, FieldValue::Bool(_))
                | (Self::Integer, FieldValue::Integer(_))
                | (Self::Float, FieldValue::Float(_) | FieldValue::Integer(_))
                | (Self::Text, FieldValue::Text(_))
                | (Self::Timestamp, FieldValue::Timestamp(_))
                | (Self::Reference { .. }, FieldValue::Reference(_))
                | (Self::ReferenceList { .. }, FieldValue::ReferenceList(_))
        )
    }

    /// The model a relational field points at
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Reference { target } | Self::ReferenceList { target } => Some(target),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("model {model} has no field {field}")]
    UnknownField { model: String, field: String },

    #[error("field {model}.{field} is {expected:?}, got a {actual} value")]
    TypeMismatch {
        model: String,
        field: String,
        expected: FieldType,
        actual: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    pub name: String,
    pub fields: IndexMap<String, FieldType>,
}

impl ModelSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: IndexMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name)
    }

    /// Relational fields and the model each points at
    pub fn references(&self) -> impl Iterator<Item = (&str, &FieldType)> {
        self.fields
            .iter()
            .filter(|(_, t)| t.target().is_some())
            .map(|(n, t)| (n.as_str(), t))
    }

    pub fn validate(&self, values: &RecordValues) -> Result<(), SchemaViolation> {
        for (field, value) in values {
            let Some(field_type) = self.fields.get(field) else {
                return Err(SchemaViolation::UnknownField {
                    model: self.name.clone(),
                    field: field.clone(),
                });
            };
            if !field_type.accepts(value) {
                return Err(SchemaViolation::TypeMismatch {
                    model: self.name.clone(),
                    field: field.clone(),
                    expected: field_type.clone(),
                    actual: value.type_name(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Write,
    Unlink,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Write => "write",
            Self::Unlink => "unlink",
        }
    }
}

impl Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Applied,
    Undone,
}

/// A record of `model` whose relational `field` pointed at `target_id` when that record was
/// unlinked
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InboundReference {
    pub model: String,
    pub field: String,
    pub source_id: RecordId,
    pub target_id: RecordId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLog {
    pub id: OperationLogId,
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub operation_type: OperationType,
    pub model: String,
    pub record_ids: Vec<RecordId>,
    /// Absent for `create`
    pub values_before: Option<RecordSet>,
    /// Absent for `unlink`
    pub values_after: Option<RecordSet>,
    /// Only for `unlink`: relations other records held to the unlinked ones
    #[serde(default)]
    pub inbound_references: Vec<InboundReference>,
    pub state: OperationState,
    /// Pre-operation snapshot taken before the mutation, if any
    pub snapshot_id: Option<SnapshotId>,
    pub created_at_ns: i64,
    pub undone_at_ns: Option<i64>,
}

impl OperationLog {
    pub fn created_at(&self) -> Time {
        Time::from_timestamp_nanos(self.created_at_ns)
    }
}

/// An operation log before the store assigns its id
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperationLog {
    pub session_id: SessionId,
    pub operation_type: OperationType,
    pub model: String,
    pub record_ids: Vec<RecordId>,
    pub values_before: Option<RecordSet>,
    pub values_after: Option<RecordSet>,
    pub inbound_references: Vec<InboundReference>,
    pub snapshot_id: Option<SnapshotId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn partner() -> ModelSchema {
        ModelSchema::new("res.partner")
            .with_field("name", FieldType::Text)
            .with_field("credit", FieldType::Float)
            .with_field(
                "company_id",
                FieldType::Reference {
                    target: "res.company".into(),
                },
            )
    }

    #[test]
    fn validates_against_schema() {
        let schema = partner();
        let ok: RecordValues = [
            ("name".to_string(), FieldValue::from("Ada")),
            ("credit".to_string(), FieldValue::Integer(3)),
            ("company_id".to_string(), FieldValue::Null),
        ]
        .into_iter()
        .collect();
        schema.validate(&ok).unwrap();

        let wrong: RecordValues = [("name".to_string(), FieldValue::Bool(true))]
            .into_iter()
            .collect();
        assert!(matches!(
            schema.validate(&wrong),
            Err(SchemaViolation::TypeMismatch { actual: "bool", .. })
        ));
        let unknown: RecordValues = [("email".to_string(), FieldValue::from("a@b"))]
            .into_iter()
            .collect();
        assert!(matches!(
            schema.validate(&unknown),
            Err(SchemaViolation::UnknownField { .. })
        ));
        assert_eq!(
            schema.references().map(|(n, _)| n).collect::<Vec<_>>(),
            vec!["company_id"]
        );
    }

    #[test]
    fn values_keep_type_tags_and_order() {
        let values: RecordValues = [
            ("z".to_string(), FieldValue::Timestamp(5)),
            ("a".to_string(), FieldValue::ReferenceList(vec![RecordId::new(1)])),
        ]
        .into_iter()
        .collect();
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(
            json,
            r#"{"z":{"type":"timestamp","value":5},"a":{"type":"reference_list","value":[1]}}"#
        );
        let back: RecordValues = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
        assert_eq!(back.keys().collect::<Vec<_>>(), vec!["z", "a"]);
    }
}
