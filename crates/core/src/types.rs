//! Identity types shared by every layer
//!
//! - QueryId: process-lifetime identifier of a compiled query
//! - Document: a stored document (arbitrary JSON tree)
//! - Reserved field names (identity, provenance, soft delete)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A stored document.
///
/// Documents are arbitrary JSON objects keyed by [`ID_FIELD`].
pub type Document = Value;

/// Identity field of every document
pub const ID_FIELD: &str = "_id";

/// Side-channel mapping top-level field name to its last edit provenance
pub const META_FIELD: &str = "_meta";

/// Soft-delete marker; documents carrying it never match any query
pub const DELETED_FIELD: &str = "_deleted";

/// Creation provenance attached by the `create` mutation
pub const CREATED_FIELD: &str = "_created";

/// Identifier of a compiled query descriptor
///
/// Allocated sequentially from 1 and stable for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(u64);

impl QueryId {
    /// Wrap a raw id
    pub const fn new(id: u64) -> Self {
        QueryId(id)
    }

    /// Raw numeric value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for QueryId {
    fn from(id: u64) -> Self {
        QueryId(id)
    }
}

/// Returns the identity value of a document, if it has one
pub fn document_id(doc: &Document) -> Option<&Value> {
    doc.get(ID_FIELD)
}

/// Render an identity value the way symbolic references spell it
///
/// Strings render bare, numbers and other scalars use their JSON form.
pub fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Canonical storage key for an identity value
///
/// Unlike [`id_to_string`] the key keeps the JSON type, so `7` and `"7"` are
/// distinct identities. Integral floats fold onto their integer form because
/// filter equality compares numbers by value.
pub fn identity_key(id: &Value) -> String {
    match id {
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (None, Some(u), _) => u.to_string(),
            (None, None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 => {
                (f as i64).to_string()
            }
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Check whether a document's identity equals the textual id `id`
///
/// Symbolic references (`&<id>`) and `remove` keys arrive as text, so a
/// numeric identity `7` matches the reference `&7`.
pub fn id_matches(doc: &Value, id: &str) -> bool {
    match doc.get(ID_FIELD) {
        Some(Value::String(s)) => s == id,
        Some(Value::Null) | None => false,
        Some(other) => other.to_string() == id,
    }
}
