//! Storage abstraction consumed by the invalidation engine
//!
//! This module defines the DocumentStore trait: the physical storage half of
//! the driver contract. The engine never touches documents except through it,
//! so any backend with find/insert/update/delete semantics can sit underneath.

use crate::error::Result;
use crate::filter::Filter;
use crate::types::Document;
use crate::update::Update;
use serde_json::Value;

/// Result of an `update_one` call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateOutcome {
    /// Identity of the existing document the filter matched
    pub matched_id: Option<Value>,
    /// Identity of the document created by an upsert
    pub upserted_id: Option<Value>,
}

impl UpdateOutcome {
    /// Identity of the document the update touched, if any
    pub fn touched_id(&self) -> Option<&Value> {
        self.matched_id.as_ref().or(self.upserted_id.as_ref())
    }
}

/// Document storage backend
///
/// Thread safety: all methods must be safe to call concurrently from
/// multiple threads (requires Send + Sync). Each call is atomic on its own;
/// no ordering is guaranteed between calls from different threads.
///
/// Filters passed in are already compiled. Soft-delete exclusion is the
/// caller's concern: backends return whatever the filter matches.
pub trait DocumentStore: Send + Sync {
    /// Find every document in `collection` matching `filter`
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>>;

    /// Find the first document in `collection` matching `filter`
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>>;

    /// Insert a new document
    ///
    /// Assigns an identity when the document has none and returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if a document with the same identity already exists
    /// or the storage operation fails.
    fn insert_one(&self, collection: &str, document: Document) -> Result<Value>;

    /// Apply `update` to the first document matching `filter`
    ///
    /// With `upsert`, a missing document is created from the filter's
    /// equality conditions before the update is applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the update cannot be applied or the storage
    /// operation fails. A failed update leaves the stored document unchanged.
    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateOutcome>;

    /// Physically remove the first document matching `filter`
    ///
    /// Returns the removed document.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>>;
}
