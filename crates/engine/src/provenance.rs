//! Field provenance annotation
//!
//! Every write records, per touched top-level field, which client made it and
//! when, under `_meta.<field>`. Entries are written one field at a time so
//! metadata for untouched fields survives. Provenance never influences query
//! matching or mutation interpretation.

use livedoc_core::{
    Document, FieldPath, Provenance, Result, Update, UpdateOp, ID_FIELD, META_FIELD,
};
use serde_json::{Map, Value};

fn is_tracked(field: &str) -> bool {
    field != ID_FIELD && field != META_FIELD
}

/// Top-level fields an update touches, in first-touch order
///
/// The identity field and the metadata field itself are never reported.
pub fn touched_fields(update: &Update) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for op in update.ops() {
        let first = match op {
            UpdateOp::Set { path, .. }
            | UpdateOp::Unset { path }
            | UpdateOp::Push { path, .. }
            | UpdateOp::Pull { path, .. } => path.first(),
        };
        if let Some(field) = first {
            if is_tracked(field) && !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        }
    }
    fields
}

/// Append `_meta.<field>` assignments for every field the update touches
pub fn annotate_update(update: &mut Update, provenance: &Provenance) -> Result<()> {
    let record = provenance.to_value()?;
    for field in touched_fields(update) {
        let path = FieldPath::from_segments(vec![META_FIELD.to_string(), field]);
        update.push_op(UpdateOp::Set {
            path,
            value: record.clone(),
        });
    }
    Ok(())
}

/// Stamp provenance for every top-level field of a document about to be inserted
///
/// Existing `_meta` entries for other fields are kept.
pub fn annotate_insert(document: &mut Document, provenance: &Provenance) -> Result<()> {
    let obj = match document.as_object_mut() {
        Some(obj) => obj,
        None => return Ok(()),
    };
    let fields: Vec<String> = obj.keys().filter(|k| is_tracked(k)).cloned().collect();
    if fields.is_empty() {
        return Ok(());
    }
    let record = provenance.to_value()?;
    let meta = obj
        .entry(META_FIELD.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    if let Some(meta) = meta.as_object_mut() {
        for field in fields {
            meta.insert(field, record.clone());
        }
    }
    Ok(())
}
