//! In-memory document store
//!
//! # Design
//!
//! - DashMap: one entry per collection, sharded locking across collections
//! - FxHashMap: O(1) identity lookups within a collection
//! - Sequence numbers: reads return documents in insertion order
//!
//! Every trait call holds the collection's shard lock for its whole duration,
//! so each call is atomic on its own. Nothing is atomic across calls.

use dashmap::DashMap;
use livedoc_core::{
    document_id, identity_key, value_type_name, values_equal, Document, DocumentStore, Error,
    Filter, Result, Update, UpdateError, UpdateOutcome, ID_FIELD,
};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredDocument {
    seq: u64,
    document: Document,
}

/// Documents of one collection, keyed by [`identity_key`]
#[derive(Debug, Default)]
pub struct Collection {
    docs: FxHashMap<String, StoredDocument>,
}

impl Collection {
    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Check if the collection is empty
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Matching documents in insertion order
    fn matching(&self, filter: &Filter) -> Vec<&StoredDocument> {
        if let Some(id) = filter.id_equality() {
            return self
                .docs
                .get(&identity_key(id))
                .filter(|stored| filter.matches(&stored.document))
                .into_iter()
                .collect();
        }
        let mut found: Vec<&StoredDocument> = self
            .docs
            .values()
            .filter(|stored| filter.matches(&stored.document))
            .collect();
        found.sort_by_key(|stored| stored.seq);
        found
    }

    fn first_matching_key(&self, filter: &Filter) -> Option<String> {
        self.matching(filter)
            .first()
            .and_then(|stored| document_id(&stored.document))
            .map(identity_key)
    }
}

/// Sharded in-memory implementation of [`DocumentStore`]
///
/// # Example
///
/// ```
/// use livedoc_core::{DocumentStore, Filter};
/// use livedoc_storage::MemoryStore;
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// store.insert_one("tasks", json!({"_id": "t1", "status": "open"})).unwrap();
/// let open = Filter::compile(&json!({"status": "open"})).unwrap();
/// assert_eq!(store.find("tasks", &open).unwrap().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<String, Collection>,
    seq: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Number of collections that have ever been written
    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    /// Number of documents stored in `collection`, soft-deleted ones included
    pub fn document_count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    #[inline]
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Give a document an identity if it lacks one, keeping `_id` first
    fn with_identity(document: Document) -> Result<(String, Document)> {
        let obj = match document {
            Value::Object(obj) => obj,
            other => {
                return Err(Error::invalid_payload(format!(
                    "document must be an object, found {}",
                    value_type_name(&other)
                )))
            }
        };
        match obj.get(ID_FIELD) {
            Some(id) if !id.is_null() => Ok((identity_key(id), Value::Object(obj))),
            _ => {
                let id = Value::String(Uuid::new_v4().to_string());
                let key = identity_key(&id);
                let mut with_id = Map::with_capacity(obj.len() + 1);
                with_id.insert(ID_FIELD.to_string(), id);
                with_id.extend(obj.into_iter().filter(|(k, _)| k != ID_FIELD));
                Ok((key, Value::Object(with_id)))
            }
        }
    }
}

impl DocumentStore for MemoryStore {
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        Ok(self
            .collections
            .get(collection)
            .map(|c| {
                c.matching(filter)
                    .into_iter()
                    .map(|stored| stored.document.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        Ok(self.collections.get(collection).and_then(|c| {
            c.matching(filter)
                .first()
                .map(|stored| stored.document.clone())
        }))
    }

    fn insert_one(&self, collection: &str, document: Document) -> Result<Value> {
        let (key, document) = Self::with_identity(document)?;
        let mut shard = self.collections.entry(collection.to_string()).or_default();
        if shard.docs.contains_key(&key) {
            return Err(Error::storage(format!(
                "duplicate key {} in collection {}",
                key, collection
            )));
        }
        let id = document_id(&document).cloned().unwrap_or(Value::Null);
        trace!(target: "livedoc::storage", collection, id = %key, "insert");
        shard.docs.insert(
            key,
            StoredDocument {
                seq: self.next_seq(),
                document,
            },
        );
        Ok(id)
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let mut shard = self.collections.entry(collection.to_string()).or_default();

        if let Some(key) = shard.first_matching_key(filter) {
            let stored = match shard.docs.get_mut(&key) {
                Some(stored) => stored,
                None => return Ok(UpdateOutcome::default()),
            };
            // Apply to a copy so a failing operator leaves the stored document intact
            let mut next = stored.document.clone();
            update.apply(&mut next)?;
            let kept = match (document_id(&stored.document), document_id(&next)) {
                (Some(old), Some(new)) => values_equal(old, new),
                _ => false,
            };
            if !kept {
                return Err(Error::invalid_payload(format!(
                    "update would change {} of document {} in collection {}",
                    ID_FIELD, key, collection
                )));
            }
            stored.document = next;
            trace!(target: "livedoc::storage", collection, id = %key, "update");
            return Ok(UpdateOutcome {
                matched_id: document_id(&stored.document).cloned(),
                upserted_id: None,
            });
        }

        if !upsert {
            return Ok(UpdateOutcome::default());
        }

        let mut seeded = filter.upsert_seed().map_err(UpdateError::from)?;
        update.apply(&mut seeded)?;
        let (key, document) = Self::with_identity(seeded)?;
        if shard.docs.contains_key(&key) {
            return Err(Error::storage(format!(
                "upsert collides with existing key {} in collection {}",
                key, collection
            )));
        }
        let id = document_id(&document).cloned();
        trace!(target: "livedoc::storage", collection, id = %key, "upsert");
        shard.docs.insert(
            key,
            StoredDocument {
                seq: self.next_seq(),
                document,
            },
        );
        Ok(UpdateOutcome {
            matched_id: None,
            upserted_id: id,
        })
    }

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        let mut shard = match self.collections.get_mut(collection) {
            Some(shard) => shard,
            None => return Ok(None),
        };
        let removed = shard
            .first_matching_key(filter)
            .and_then(|key| shard.docs.remove(&key))
            .map(|stored| stored.document);
        if removed.is_some() {
            trace!(target: "livedoc::storage", collection, "delete");
        }
        Ok(removed)
    }
}
