//! Query registry
//!
//! Maps a query signature (`collection.method.<filter JSON>`) to a compiled
//! [`QueryDescriptor`] with a process-lifetime id. Descriptors are created on
//! first use and never evicted.
//!
//! Signatures use the filter's serialization as given, so `{a:1,b:2}` and
//! `{b:2,a:1}` are distinct queries with distinct ids.

use livedoc_core::{is_soft_deleted, Document, Filter, QueryId, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A compiled, registry-resident query
#[derive(Debug)]
pub struct QueryDescriptor {
    id: QueryId,
    collection: String,
    method: String,
    signature: String,
    filter: Filter,
}

impl QueryDescriptor {
    /// The query id
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// The collection the query reads
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The read method (`find`, `findOne`)
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The registry key
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The compiled filter
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Evaluate the predicate against a snapshot
    ///
    /// An absent document never matches, and neither does a soft-deleted one.
    pub fn matches(&self, doc: Option<&Document>) -> bool {
        match doc {
            Some(doc) => !is_soft_deleted(doc) && self.filter.matches(doc),
            None => false,
        }
    }
}

#[derive(Default)]
struct RegistryTables {
    by_signature: FxHashMap<String, Arc<QueryDescriptor>>,
    by_id: FxHashMap<QueryId, Arc<QueryDescriptor>>,
    by_collection: FxHashMap<String, Vec<Arc<QueryDescriptor>>>,
}

/// Insert-or-lookup table of compiled queries
pub struct QueryRegistry {
    tables: RwLock<RegistryTables>,
    next_id: AtomicU64,
}

impl QueryRegistry {
    /// Create an empty registry; the first query gets id 1
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(RegistryTables::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Look up or compile the descriptor for `(collection, method, filter)`
    ///
    /// A `null` filter is treated as `{}`. A malformed filter fails with
    /// [`livedoc_core::Error::Compilation`] before any id is allocated.
    pub fn compile(&self, collection: &str, method: &str, filter: &Value) -> Result<Arc<QueryDescriptor>> {
        let empty;
        let filter = if filter.is_null() {
            empty = Value::Object(Map::new());
            &empty
        } else {
            filter
        };
        let signature = format!("{}.{}.{}", collection, method, serde_json::to_string(filter)?);

        if let Some(found) = self.tables.read().by_signature.get(&signature) {
            return Ok(Arc::clone(found));
        }

        let compiled = Filter::compile(filter)?;

        let mut tables = self.tables.write();
        // Another caller may have registered the signature while we compiled
        if let Some(found) = tables.by_signature.get(&signature) {
            return Ok(Arc::clone(found));
        }
        let id = QueryId::new(self.next_id.fetch_add(1, Ordering::AcqRel));
        let descriptor = Arc::new(QueryDescriptor {
            id,
            collection: collection.to_string(),
            method: method.to_string(),
            signature: signature.clone(),
            filter: compiled,
        });
        debug!(target: "livedoc::registry", %id, %signature, "registered query");
        tables.by_id.insert(id, Arc::clone(&descriptor));
        tables
            .by_collection
            .entry(collection.to_string())
            .or_default()
            .push(Arc::clone(&descriptor));
        tables.by_signature.insert(signature, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Every descriptor registered for `collection`, in id order
    pub fn for_collection(&self, collection: &str) -> Vec<Arc<QueryDescriptor>> {
        self.tables
            .read()
            .by_collection
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Descriptor by id
    pub fn get(&self, id: QueryId) -> Option<Arc<QueryDescriptor>> {
        self.tables.read().by_id.get(&id).cloned()
    }

    /// Number of registered queries
    pub fn len(&self) -> usize {
        self.tables.read().by_id.len()
    }

    /// Check if no query has been registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
