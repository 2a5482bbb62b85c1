//! Change event representation
//!
//! Raw records arrive from the log-tailing engine as [`SourceRecord`]s and
//! are canonicalized into [`ChangeEvent`] envelopes before publication.
//!
//! ## Sentinel rule
//!
//! A published envelope never carries an absent key or value: both are
//! substituted with the fixed sentinel `"default"` when the source record
//! omits them. Tombstones and keyless heartbeat rows therefore publish
//! cleanly instead of erroring.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Substituted for an absent key or value at envelope construction.
pub const DEFAULT_SENTINEL: &str = "default";

/// Header carrying the operation type on records emitted by the engine.
pub const OP_HEADER: &str = "__op";

/// Operation type of a captured change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// Initial snapshot read
    Snapshot,
    /// Missing or unrecognized op header
    Unknown,
}

impl OpType {
    /// Derive the operation type from the `__op` header value.
    ///
    /// A missing or unrecognized header yields [`OpType::Unknown`]; this
    /// never errors, so a malformed record still flows downstream.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some("c") => OpType::Insert,
            Some("u") => OpType::Update,
            Some("d") => OpType::Delete,
            Some("r") => OpType::Snapshot,
            _ => OpType::Unknown,
        }
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpType::Insert => write!(f, "INSERT"),
            OpType::Update => write!(f, "UPDATE"),
            OpType::Delete => write!(f, "DELETE"),
            OpType::Snapshot => write!(f, "SNAPSHOT"),
            OpType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A raw record delivered by the log-tailing engine.
///
/// Key and value are the engine's string-serialized document state; either
/// may be absent. Headers carry the op type under [`OP_HEADER`].
#[derive(Debug, Clone, Default)]
pub struct SourceRecord {
    pub key: Option<String>,
    pub value: Option<String>,
    pub headers: HashMap<String, String>,
    /// Logical routing key identifying the source collection.
    pub destination: String,
    /// Source timestamp (epoch millis), when the engine provides one.
    pub timestamp: Option<i64>,
}

impl SourceRecord {
    /// Create a record with the given destination and op header.
    pub fn new(destination: impl Into<String>, op_header: Option<&str>) -> Self {
        let mut headers = HashMap::new();
        if let Some(op) = op_header {
            headers.insert(OP_HEADER.to_string(), op.to_string());
        }
        Self {
            destination: destination.into(),
            headers,
            ..Default::default()
        }
    }

    /// Set the record key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the record value.
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Set the source timestamp.
    pub fn with_timestamp(mut self, ts: i64) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Operation type derived from the op header.
    pub fn op(&self) -> OpType {
        OpType::from_header(self.headers.get(OP_HEADER).map(String::as_str))
    }

    /// Key used for snapshot deduplication; keyless records collapse under
    /// the sentinel.
    pub fn dedup_key(&self) -> &str {
        self.key.as_deref().unwrap_or(DEFAULT_SENTINEL)
    }
}

/// The canonical envelope published to the event bus.
///
/// Immutable once constructed: build one with [`ChangeEvent::from_record`]
/// and read fields through the accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    key: String,
    value: String,
    op: OpType,
    destination: String,
    timestamp: Option<i64>,
}

impl ChangeEvent {
    /// Canonicalize a raw record into an envelope.
    ///
    /// Applies the sentinel rule to key and value, derives the op type, and
    /// scrubs `excluded_fields` from JSON-object values. A value that is not
    /// a JSON object passes through untouched.
    pub fn from_record(record: &SourceRecord, excluded_fields: &[String]) -> Self {
        let value = match record.value.as_deref() {
            Some(raw) => scrub_fields(raw, excluded_fields),
            None => DEFAULT_SENTINEL.to_string(),
        };

        Self {
            key: record
                .key
                .clone()
                .unwrap_or_else(|| DEFAULT_SENTINEL.to_string()),
            value,
            op: record.op(),
            destination: record.destination.clone(),
            timestamp: record.timestamp,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn op(&self) -> OpType {
        self.op
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }
}

/// Remove excluded fields from a JSON-object payload.
///
/// Non-JSON values and non-object JSON are returned unchanged; exclusion is
/// best-effort field dropping, not schema transformation.
fn scrub_fields(raw: &str, excluded_fields: &[String]) -> String {
    if excluded_fields.is_empty() {
        return raw.to_string();
    }

    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(mut map)) => {
            for field in excluded_fields {
                map.remove(field);
            }
            serde_json::Value::Object(map).to_string()
        }
        _ => raw.to_string(),
    }
}
