//! # Core Type Definitions
//!
//! This module contains the types shared by every rowvault component:
//! - Partition and record identifiers (`TenantId`, `EntityId`, `RelationId`, `ObservationId`)
//! - Row payloads (`FieldValue`, `Row`)
//! - Knowledge-graph records (`Entity`, `Relation`, `Observation`)
//! - Error types (`VaultError`)
//!
//! ## Row Schema Policy
//!
//! Rows are ordered `(column, value)` sequences. Column order is the order in
//! which the producer emitted the fields and is preserved through storage.
//! Wherever a schema has to be inferred (analytics reconstruction), the FIRST
//! row's columns are authoritative.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// =============================================================================
// TENANT
// =============================================================================

/// Maximum length of a tenant identifier.
pub const MAX_TENANT_LENGTH: usize = 128;

/// Identifier of a tenant/instance partition.
///
/// Always a safe single path component: non-empty, at most
/// `MAX_TENANT_LENGTH` characters from `[A-Za-z0-9._-]`, and never `.`/`..`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    /// Validate and wrap a tenant identifier.
    pub fn new(raw: impl Into<String>) -> Result<Self, VaultError> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_TENANT_LENGTH {
            return Err(VaultError::InvalidArgument(format!(
                "tenant id must be 1..={} characters",
                MAX_TENANT_LENGTH
            )));
        }
        if raw == "." || raw == ".." {
            return Err(VaultError::InvalidArgument(
                "tenant id cannot be a relative path".to_string(),
            ));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(VaultError::InvalidArgument(format!(
                "tenant id '{}' contains characters outside [A-Za-z0-9._-]",
                raw
            )));
        }
        Ok(Self(raw))
    }

    /// Get the tenant as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// RECORD IDENTIFIERS
// =============================================================================

/// Identifier of an entity, unique within a tenant partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

/// Identifier of a relation, unique within a tenant partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationId(pub u64);

/// Identifier of an observation, unique within a tenant partition.
///
/// Ids are allocated from a monotonically increasing counter, so ordering by
/// id is insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// FIELD VALUES
// =============================================================================

/// A single scalar cell of a result row.
///
/// Numbers keep their exact JSON representation so a stored row reads back
/// identically. Composite JSON values are flattened to their JSON text when
/// converted from `serde_json::Value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl FieldValue {
    /// Text rendering of the value; `None` for `Null`.
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Number(n) => Some(n.to_string()),
            Self::Text(s) => Some(s.clone()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for FieldValue {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n)
            .map(Self::Number)
            .unwrap_or(Self::Null)
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::Text(s),
            composite => Self::Text(composite.to_string()),
        }
    }
}

// =============================================================================
// ROW
// =============================================================================

/// One row of a tabular result: ordered `(column, value)` pairs.
///
/// Serialized as a JSON object whose key order is the column order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    fields: Vec<(String, FieldValue)>,
}

impl Row {
    /// Create an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(column, value);
        self
    }

    /// Insert a field. Replaces the value in place if the column already exists.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<FieldValue>) {
        let column = column.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((column, value)),
        }
    }

    /// Look up a field by column name.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// Column names in order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(c, _)| c.as_str())
    }

    /// Fields in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(c, v)| (c.as_str(), v))
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the row has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Self::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (column, value) in &self.fields {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

struct RowVisitor;

impl<'de> Visitor<'de> for RowVisitor {
    type Value = Row;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of column name to scalar value")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Row, A::Error> {
        let mut row = Row {
            fields: Vec::with_capacity(access.size_hint().unwrap_or(0)),
        };
        while let Some((column, value)) = access.next_entry::<String, serde_json::Value>()? {
            row.insert(column, FieldValue::from(value));
        }
        Ok(row)
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RowVisitor)
    }
}

// =============================================================================
// KNOWLEDGE-GRAPH RECORDS
// =============================================================================

/// Free-form key → scalar mapping attached to records.
pub type Metadata = BTreeMap<String, FieldValue>;

/// A named, typed node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Creation time, Unix milliseconds.
    pub created_at: u64,
}

/// A directed, typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    pub from: EntityId,
    pub to: EntityId,
    pub relation_type: String,
    #[serde(default)]
    pub properties: Metadata,
    pub created_at: u64,
}

impl Relation {
    /// Check if the entity is either endpoint of this relation.
    #[must_use]
    pub fn touches(&self, entity: EntityId) -> bool {
        self.from == entity || self.to == entity
    }
}

/// A timestamped fact attached to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub id: ObservationId,
    pub entity_id: EntityId,
    pub content: String,
    pub observation_type: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: u64,
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in rowvault.
///
/// - No silent failures: every fallible operation returns `Result<T, VaultError>`
/// - Cache misses are not errors; lookups return `Option`
/// - Context (which tenant, which key) travels with the error
#[derive(Debug, Error)]
pub enum VaultError {
    /// A record or filter does not exist.
    #[error("{kind} not found: {key} (tenant {tenant})")]
    NotFound {
        kind: &'static str,
        key: String,
        tenant: String,
    },

    /// An argument was rejected before any state was touched.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An entity has no stored chunks to analyze.
    #[error("No data stored for entity {0}")]
    NoData(EntityId),

    /// Rows do not fit the inferred schema.
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// An ad-hoc query was rejected or failed in the relational engine.
    #[error("Query error: {0}")]
    QueryError(String),

    /// Durable backing could not be opened or written.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A chunked store was interrupted by its cancellation flag.
    #[error("Cancelled after {written_rows} rows in {written_chunks} chunks")]
    Cancelled {
        written_rows: usize,
        written_chunks: usize,
    },

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

impl VaultError {
    /// Build a `NotFound` error.
    pub fn not_found(kind: &'static str, key: impl fmt::Display, tenant: &TenantId) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
            tenant: tenant.to_string(),
        }
    }

    /// Check if this is a `NotFound` error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<std::io::Error> for VaultError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_rejects_path_tricks() {
        assert!(TenantId::new("fwd-app").is_ok());
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("..").is_err());
        assert!(TenantId::new("a/b").is_err());
        assert!(TenantId::new("x".repeat(MAX_TENANT_LENGTH + 1)).is_err());
    }

    #[test]
    fn row_preserves_column_order_through_json() {
        let row = Row::new()
            .with("zeta", "z")
            .with("alpha", 1i64)
            .with("mid", FieldValue::Null)
            .with("flag", true);

        let json = serde_json::to_string(&row).expect("serialize");
        assert_eq!(json, r#"{"zeta":"z","alpha":1,"mid":null,"flag":true}"#);

        let back: Row = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, row);
        assert_eq!(back.columns().collect::<Vec<_>>(), ["zeta", "alpha", "mid", "flag"]);
    }

    #[test]
    fn row_insert_replaces_in_place() {
        let mut row = Row::new().with("a", 1i64).with("b", 2i64);
        row.insert("a", "one");
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("a"), Some(&FieldValue::from("one")));
        assert_eq!(row.columns().next(), Some("a"));
    }

    #[test]
    fn composite_json_values_flatten_to_text() {
        let row: Row = serde_json::from_str(r#"{"ifaces":["e0","e1"],"n":2.5}"#).expect("parse");
        assert_eq!(row.get("ifaces"), Some(&FieldValue::from(r#"["e0","e1"]"#)));
        assert_eq!(row.get("n").and_then(FieldValue::as_text), Some("2.5".to_string()));
    }

    #[test]
    fn relation_touches_both_endpoints() {
        let rel = Relation {
            id: RelationId(1),
            from: EntityId(1),
            to: EntityId(2),
            relation_type: "derived_from".to_string(),
            properties: Metadata::new(),
            created_at: 0,
        };
        assert!(rel.touches(EntityId(1)));
        assert!(rel.touches(EntityId(2)));
        assert!(!rel.touches(EntityId(3)));
    }
}
