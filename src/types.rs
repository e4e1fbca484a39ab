//! Core types for the reconciliation engine.

use crate::error::{EngineError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Globally unique key of a watched row.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        EntityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId(s.to_string())
    }
}

/// Identity of the authenticated user, as handed out by the auth collaborator.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote table a change event or fetch refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Invoices,
    FieldConfigurations,
    SystemLogs,
    #[serde(rename = "sap_logs")]
    IntegrationLogs,
}

impl Source {
    /// Remote table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Invoices => "invoices",
            Source::FieldConfigurations => "field_configurations",
            Source::SystemLogs => "system_logs",
            Source::IntegrationLogs => "sap_logs",
        }
    }

    /// Log tables only ever grow; rows are never updated or deleted.
    pub fn is_append_only(&self) -> bool {
        matches!(self, Source::SystemLogs | Source::IntegrationLogs)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of mutation carried by a change event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => f.write_str("INSERT"),
            ChangeKind::Update => f.write_str("UPDATE"),
            ChangeKind::Delete => f.write_str("DELETE"),
        }
    }
}

/// A notification that a remote row was inserted, updated or deleted.
///
/// `record` is the row as the remote system frames it: the new row for
/// inserts and updates, the old row (at least its `id`) for deletes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source: Source,
    pub kind: ChangeKind,
    pub record: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(source: Source, kind: ChangeKind, record: serde_json::Value) -> Self {
        Self {
            source,
            kind,
            record,
        }
    }

    pub fn insert(source: Source, record: serde_json::Value) -> Self {
        Self::new(source, ChangeKind::Insert, record)
    }

    pub fn update(source: Source, record: serde_json::Value) -> Self {
        Self::new(source, ChangeKind::Update, record)
    }

    pub fn delete(source: Source, id: impl Into<String>) -> Self {
        Self::new(
            source,
            ChangeKind::Delete,
            serde_json::json!({ "id": id.into() }),
        )
    }

    /// The row key, if the record carries a string `id`.
    pub fn key(&self) -> Option<EntityId> {
        self.record
            .get("id")
            .and_then(|v| v.as_str())
            .map(EntityId::from)
    }
}

/// A single scalar value in an editable payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// Field name to scalar value. Ordered so equality and serialization are stable.
pub type Payload = BTreeMap<String, FieldValue>;

/// Decode a JSON object into a [`Payload`], rejecting nested values.
pub fn payload_from_json(value: &serde_json::Value) -> Result<Payload> {
    match value {
        serde_json::Value::Null => Ok(Payload::new()),
        serde_json::Value::Object(_) => Ok(serde_json::from_value(value.clone())?),
        other => Err(EngineError::Decode(format!(
            "expected object payload, got {}",
            other
        ))),
    }
}

/// A row the engine can hold in a store.
pub trait Entity: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Remote table this entity lives in.
    const SOURCE: Source;

    fn id(&self) -> &EntityId;
}

/// Decode a wire row into a typed entity.
pub fn decode_row<T: Entity>(row: &serde_json::Value) -> Result<T> {
    serde_json::from_value(row.clone())
        .map_err(|e| EngineError::Decode(format!("{} row: {}", T::SOURCE, e)))
}
