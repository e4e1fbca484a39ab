//! Typed rows for the watched tables.

use crate::types::{Entity, EntityId, Payload, Source, UserId};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Nullable maps on the wire decode as empty maps.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Processing status of an invoice. Only ever changed by the remote pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Uploaded,
    Processing,
    Validated,
    Flagged,
    Integrated,
}

/// An uploaded document and the fields the pipeline extracted from it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: EntityId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub file_path: Option<String>,
    pub status: InvoiceStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub extracted_data: Payload,
    #[serde(default, deserialize_with = "null_as_default")]
    pub confidence_scores: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub validation_errors: BTreeMap<String, String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Invoice {
    /// Confidence for a field, if the pipeline reported one.
    pub fn confidence(&self, field: &str) -> Option<f64> {
        self.confidence_scores.get(field).copied()
    }

    pub fn has_validation_errors(&self) -> bool {
        !self.validation_errors.is_empty()
    }
}

impl Entity for Invoice {
    const SOURCE: Source = Source::Invoices;

    fn id(&self) -> &EntityId {
        &self.id
    }
}

/// Value type the pipeline should produce for a configured field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Date,
    Currency,
}

/// A field the extraction pipeline is asked to populate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldConfiguration {
    pub id: EntityId,
    pub field_name: String,
    pub display_name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub prompt_instruction: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Entity for FieldConfiguration {
    const SOURCE: Source = Source::FieldConfigurations;

    fn id(&self) -> &EntityId {
        &self.id
    }
}

/// System log line. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: EntityId,
    #[serde(default)]
    pub invoice_id: Option<EntityId>,
    pub log_type: String,
    pub message: String,
    #[serde(default, rename = "log_metadata")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Entity for LogEntry {
    const SOURCE: Source = Source::SystemLogs;

    fn id(&self) -> &EntityId {
        &self.id
    }
}

/// Record of one exchange with the downstream integration. Immutable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrationLogEntry {
    pub id: EntityId,
    pub invoice_id: EntityId,
    pub request_payload: serde_json::Value,
    #[serde(default)]
    pub response_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl IntegrationLogEntry {
    /// A 2xx status code was recorded.
    pub fn is_success(&self) -> bool {
        matches!(self.status_code, Some(code) if (200..300).contains(&code))
    }
}

impl Entity for IntegrationLogEntry {
    const SOURCE: Source = Source::IntegrationLogs;

    fn id(&self) -> &EntityId {
        &self.id
    }
}
