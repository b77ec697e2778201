//! Document metadata helpers
//!
//! Documents carry three reserved side-channel fields next to their content:
//! `_meta` (per-field [`Provenance`]), `_created` and `_deleted`
//! (both [`EditStamp`]s). None of them ever stores document content.

use crate::error::Result;
use crate::types::{document_id, id_to_string, Document, DELETED_FIELD, META_FIELD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which client last touched a field, and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Client identifier, if the writer supplied one
    pub client: Option<String>,
    /// Time of the write
    pub timestamp: DateTime<Utc>,
}

impl Provenance {
    /// Create a provenance record
    pub fn new(client: Option<String>, timestamp: DateTime<Utc>) -> Self {
        Provenance { client, timestamp }
    }

    /// Serialize to the stored form
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Creation or deletion marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditStamp {
    /// Time of the edit
    pub timestamp: DateTime<Utc>,
    /// Acting user, if known
    pub user: Option<String>,
}

impl EditStamp {
    /// Create a stamp
    pub fn new(timestamp: DateTime<Utc>, user: Option<String>) -> Self {
        EditStamp { timestamp, user }
    }

    /// Serialize to the stored form
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Check if a document carries the soft-delete marker
pub fn is_soft_deleted(doc: &Document) -> bool {
    doc.get(DELETED_FIELD).is_some()
}

/// Build the field provenance map returned alongside reads
///
/// Keys are `"<docId>.<field>"`, values are the stored `_meta` entries.
/// Documents without `_meta` contribute nothing.
pub fn build_field_provenance<'a>(docs: impl IntoIterator<Item = &'a Document>) -> Map<String, Value> {
    let mut meta = Map::new();
    for doc in docs {
        let fields = match doc.get(META_FIELD).and_then(Value::as_object) {
            Some(fields) => fields,
            None => continue,
        };
        let id = document_id(doc).map(id_to_string).unwrap_or_default();
        for (field, provenance) in fields {
            meta.insert(format!("{}.{}", id, field), provenance.clone());
        }
    }
    meta
}
