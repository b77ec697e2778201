//! Mutation interpreter
//!
//! Translates client [`MutationRecord`]s into typed updates against one
//! collection. Each path-bearing record re-reads the target document and
//! resolves its path against that fresh snapshot, so record N+1 sees the
//! effects of record N.
//!
//! The read-resolve-write sequence of a record is not atomic. A concurrent
//! writer to the same document can shift an array between resolution and
//! write, in which case the record lands on whatever now sits at the resolved
//! index. A failed record aborts the rest of its batch without rolling back
//! earlier records.

use crate::resolver::resolve_path;
use chrono::Utc;
use livedoc_core::{
    id_matches, ClientPayload, Document, EditStamp, Error, FieldPath, Filter, MutationPath,
    MutationRecord, PathSegment, PullCriterion, Result, Update, CREATED_FIELD, DELETED_FIELD,
    ID_FIELD,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

/// Write access to one collection, as seen by the interpreter
///
/// Implementations are expected to notify observers and annotate provenance;
/// the interpreter only decides which operations to issue.
pub trait CollectionWriter {
    /// Read the document with identity `id`
    fn find(&self, id: &Value) -> Result<Option<Document>>;

    /// Apply `update` to the first document matching `filter`
    fn update_one(&self, filter: &Filter, update: Update, upsert: bool) -> Result<()>;

    /// Insert a new document, returning its identity
    fn insert_one(&self, document: Document) -> Result<Value>;
}

/// Executes mutation records against a [`CollectionWriter`]
pub struct MutationInterpreter<'a, W: CollectionWriter + ?Sized> {
    writer: &'a W,
    user: Option<String>,
}

impl<'a, W: CollectionWriter + ?Sized> MutationInterpreter<'a, W> {
    /// Create an interpreter; `user` is recorded in creation and deletion stamps
    pub fn new(writer: &'a W, user: Option<String>) -> Self {
        Self { writer, user }
    }

    /// Apply every record of a payload in order
    ///
    /// Stops at the first failure and returns [`Error::MutationFailed`] with
    /// the offending record attached. Records before it stay applied. A
    /// record that never parsed fails at its own position, after the records
    /// before it have run.
    pub fn apply_payload(&self, payload: &ClientPayload) -> Result<()> {
        for (index, mutation) in payload.mutations.iter().enumerate() {
            if let Err(e) = self.apply(&payload.id, mutation) {
                let wire = serde_json::to_value(mutation)?;
                return Err(failed(payload, index, wire, e));
            }
        }
        if let Some(wire) = &payload.rejected {
            let index = payload.mutations.len();
            let e = match MutationRecord::from_wire(wire) {
                Ok(mutation) => match self.apply(&payload.id, &mutation) {
                    Ok(()) => None,
                    Err(e) => Some(e),
                },
                Err(e) => Some(e),
            };
            if let Some(e) = e {
                return Err(failed(payload, index, wire.clone(), e));
            }
        }
        debug!(
            target: "livedoc::mutation",
            collection = %payload.collection,
            id = %payload.id,
            count = payload.len(),
            "applied mutations"
        );
        Ok(())
    }

    /// Apply one record to the document with identity `id`
    pub fn apply(&self, id: &Value, mutation: &MutationRecord) -> Result<()> {
        let by_id = Filter::by_id(id);
        match mutation {
            MutationRecord::Set { path, value } => {
                let field = self.resolve_field(id, path)?;
                self.writer
                    .update_one(&by_id, Update::new().set(field, value.clone()), true)
            }
            MutationRecord::Unset { path } => {
                let field = self.resolve_field(id, path)?;
                self.writer.update_one(&by_id, Update::new().unset(field), true)
            }
            MutationRecord::Remove { path, key, index } => {
                let doc = self.writer.find(id)?;
                let resolved = resolve_path(doc.as_ref(), path)?;
                match key {
                    Some(key) => self.remove_by_key(&by_id, doc.as_ref(), &resolved, key),
                    None => self.remove_at(&by_id, doc.as_ref(), &resolved, *index),
                }
            }
            MutationRecord::Insert { path, index, el } => {
                let doc = self.writer.find(id)?;
                let resolved = resolve_path(doc.as_ref(), path)?;
                let (array, position) = match index {
                    Some(i) => (resolved, Some(*i)),
                    None => split_trailing_index(&resolved),
                };
                let array = non_empty_field(&array, path)?;
                self.writer
                    .update_one(&by_id, Update::new().push(array, vec![el.clone()], position), false)
            }
            MutationRecord::Create { document } => {
                let mut document = document.clone();
                if let Some(obj) = document.as_object_mut() {
                    obj.insert(CREATED_FIELD.to_string(), self.stamp()?);
                }
                self.writer.insert_one(document).map(|_| ())
            }
            MutationRecord::Delete => {
                let field = FieldPath::from_segments(vec![DELETED_FIELD.to_string()]);
                self.writer
                    .update_one(&by_id, Update::new().set(field, self.stamp()?), false)
            }
        }
    }

    fn stamp(&self) -> Result<Value> {
        EditStamp::new(Utc::now(), self.user.clone()).to_value()
    }

    fn resolve_field(&self, id: &Value, path: &MutationPath) -> Result<FieldPath> {
        let resolved = if path.has_refs() {
            let doc = self.writer.find(id)?;
            resolve_path(doc.as_ref(), path)?
        } else {
            path.clone()
        };
        non_empty_field(&resolved, path)
    }

    /// Content-addressed removal: pull every element whose identity is `key`
    fn remove_by_key(
        &self,
        by_id: &Filter,
        doc: Option<&Document>,
        array: &MutationPath,
        key: &str,
    ) -> Result<()> {
        let field = non_empty_field(array, array)?;
        // Pull by the stored identity value so numeric ids match textual keys
        let identity = doc
            .and_then(|d| livedoc_core::get_at_path(d, &field))
            .and_then(Value::as_array)
            .and_then(|arr| arr.iter().find(|el| id_matches(el, key)))
            .and_then(|el| el.get(ID_FIELD))
            .cloned()
            .unwrap_or_else(|| Value::String(key.to_string()));
        let mut selector = Map::new();
        selector.insert(ID_FIELD.to_string(), identity);
        let criterion = PullCriterion::Document(Filter::compile(&Value::Object(selector))?);
        self.writer
            .update_one(by_id, Update::new().pull(field, criterion), false)
    }

    /// Positional removal in two phases: mark the slot with a fresh sentinel,
    /// then pull the sentinel
    ///
    /// The position must address an existing element of an existing array in
    /// the snapshot, so a removal never pads the array.
    fn remove_at(
        &self,
        by_id: &Filter,
        doc: Option<&Document>,
        resolved: &MutationPath,
        index: Option<usize>,
    ) -> Result<()> {
        let (array, position) = match index {
            Some(i) => (resolved.clone(), i),
            None => match split_trailing_index(resolved) {
                (array, Some(i)) => (array, i),
                (_, None) => {
                    return Err(Error::invalid_payload(format!(
                        "remove at {} needs a key, an index or a trailing index segment",
                        resolved
                    )))
                }
            },
        };
        let slot = non_empty_field(&array.clone().child(position), resolved)?;
        let array = non_empty_field(&array, resolved)?;

        let len = doc
            .and_then(|d| livedoc_core::get_at_path(d, &array))
            .and_then(Value::as_array)
            .map(Vec::len);
        match len {
            Some(len) if position < len => {}
            Some(len) => {
                return Err(Error::invalid_payload(format!(
                    "remove index {} is out of range for {} of length {}",
                    position, array, len
                )))
            }
            None => {
                return Err(Error::invalid_payload(format!(
                    "remove at {} does not address an array",
                    resolved
                )))
            }
        }

        let sentinel = Value::String(Uuid::new_v4().to_string());
        self.writer
            .update_one(by_id, Update::new().set(slot, sentinel.clone()), false)?;
        self.writer.update_one(
            by_id,
            Update::new().pull(array, PullCriterion::Equals(sentinel)),
            false,
        )
    }
}

fn failed(payload: &ClientPayload, index: usize, mutation: Value, source: Error) -> Error {
    warn!(
        target: "livedoc::mutation",
        collection = %payload.collection,
        id = %payload.id,
        index,
        %mutation,
        error = %source,
        "Mutation failed"
    );
    Error::MutationFailed {
        index,
        mutation: Box::new(mutation),
        source: Box::new(source),
    }
}

/// Split `items.3` into (`items`, Some(3)); other paths come back whole
fn split_trailing_index(path: &MutationPath) -> (MutationPath, Option<usize>) {
    match path.split_last() {
        Some((PathSegment::Index(i), parent)) => (parent, Some(*i)),
        _ => (path.clone(), None),
    }
}

fn non_empty_field(resolved: &MutationPath, original: &MutationPath) -> Result<FieldPath> {
    match resolved.to_field_path() {
        Some(field) if !field.is_empty() => Ok(field),
        Some(_) => Err(Error::invalid_payload(format!(
            "mutation path {} addresses the whole document",
            original
        ))),
        None => Err(Error::PathResolution {
            path: original.clone(),
        }),
    }
}
