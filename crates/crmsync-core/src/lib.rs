//! Core domain model for CRM deal synchronization: the loosely-typed raw
//! record as returned by the source API, the declarative field schema, and
//! the normalized record handed to the persistence sink.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "crmsync-core";

/// One untyped value inside a raw deal, as the source API serializes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    /// Render a scalar value as a string. Whole numbers drop the trailing
    /// `.0` so numeric IDs round-trip cleanly; lists and nulls are `None`.
    pub fn as_str_coerced(&self) -> Option<String> {
        match self {
            Value::Null | Value::List(_) => None,
            Value::Bool(b) => Some(if *b { "Y".to_string() } else { "N".to_string() }),
            Value::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    Some(format!("{}", *n as i64))
                } else {
                    Some(n.to_string())
                }
            }
            Value::Str(s) => Some(s.clone()),
        }
    }

    /// Interpret the value as a list of option codes. Any non-list input is
    /// an empty list, never an error.
    pub fn as_code_list(&self) -> Vec<String> {
        match self {
            Value::List(items) => items.iter().filter_map(Value::as_str_coerced).collect(),
            _ => Vec::new(),
        }
    }
}

/// An open mapping from source field identifier to untyped value, exactly as
/// one element of the API `result` array deserializes. Ephemeral: lives only
/// between fetch and transform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawDeal(pub BTreeMap<String, Value>);

impl RawDeal {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<String> {
        self.0.get(field).and_then(Value::as_str_coerced)
    }

    pub fn get_codes(&self, field: &str) -> Vec<String> {
        self.0
            .get(field)
            .map(Value::as_code_list)
            .unwrap_or_default()
    }

    /// The stable external identifier. Missing or null IDs make a record
    /// unusable as an upsert key.
    pub fn id(&self) -> Option<String> {
        self.get_str(FIELD_ID)
    }
}

pub const FIELD_ID: &str = "ID";
pub const FIELD_CATEGORY: &str = "CATEGORY_ID";
pub const FIELD_STAGE: &str = "STAGE_ID";
pub const FIELD_CARRIERS: &str = "UF_CRM_1699452141037";

/// How a source field is mapped into the normalized schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// ISO-8601 timestamp formatted as `DD/MM/YYYY`; malformed input is null.
    Date,
    /// Category code resolved to its name; unknown codes pass through.
    Category,
    /// Stage code resolved within its category's stage map; unknown codes
    /// pass through.
    Stage,
    /// List of option codes resolved to labels and joined with `", "`;
    /// unknown codes are dropped.
    MultiSelect,
    /// Copied as-is.
    Text,
}

/// One row of the declarative schema table: source field identifier,
/// normalized column name, and value kind.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub source: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
}

/// The normalized deal schema, minus the `id` key column. The transformer
/// iterates this table and the sink derives its column list from it, so the
/// source field identifiers live in exactly one place.
pub const DEAL_SCHEMA: &[FieldSpec] = &[
    FieldSpec { source: "TITLE", column: "title", kind: FieldKind::Text },
    FieldSpec { source: FIELD_STAGE, column: "stage", kind: FieldKind::Stage },
    FieldSpec { source: FIELD_CATEGORY, column: "category", kind: FieldKind::Category },
    FieldSpec { source: "DATE_CREATE", column: "created_on", kind: FieldKind::Date },
    FieldSpec { source: "UF_CRM_1698761151613", column: "installed_on", kind: FieldKind::Date },
    FieldSpec { source: FIELD_CARRIERS, column: "carriers", kind: FieldKind::MultiSelect },
    FieldSpec { source: "CONTACT_ID", column: "contact", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1698698407472", column: "phone_primary", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1698698858832", column: "phone_secondary", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1697653896576", column: "service_order", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1697762313423", column: "customer_name", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1697763267151", column: "mother_name", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1697764091406", column: "due_date", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1697807340141", column: "email", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1697807353336", column: "tax_id", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1697807372536", column: "id_document", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1697808018193", column: "landmark", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1698688252221", column: "street", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1700661314351", column: "postal_code", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1700661287551", column: "district", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1731588487", column: "city", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1700661252544", column: "street_number", kind: FieldKind::Text },
    FieldSpec { source: "UF_CRM_1731589190", column: "state", kind: FieldKind::Text },
];

/// The canonical persisted representation: the external ID plus one value
/// per schema column. Every non-key column is idempotently overwritable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedDeal {
    pub id: String,
    fields: BTreeMap<&'static str, Option<String>>,
}

impl NormalizedDeal {
    pub fn new(id: String) -> Self {
        let fields = DEAL_SCHEMA
            .iter()
            .map(|spec| (spec.column, None))
            .collect();
        Self { id, fields }
    }

    pub fn set(&mut self, column: &'static str, value: Option<String>) {
        self.fields.insert(column, value);
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).and_then(|v| v.as_deref())
    }

    /// Column values in `DEAL_SCHEMA` order, for positional binding.
    pub fn values_in_schema_order(&self) -> Vec<Option<&str>> {
        DEAL_SCHEMA.iter().map(|spec| self.get(spec.column)).collect()
    }
}

/// Format an ISO-8601 timestamp (offset-aware or naive) as `DD/MM/YYYY`,
/// discarding any timezone offset. Empty or malformed input is `None`.
pub fn format_date(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_local().format("%d/%m/%Y").to_string());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.format("%d/%m/%Y").to_string());
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date.format("%d/%m/%Y").to_string());
    }
    None
}
