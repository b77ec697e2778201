//! Mutation path resolution
//!
//! Replaces every symbolic `&id` segment of a client path with the numeric
//! index of the first array element whose identity equals `id`, walking the
//! live document left to right. Missing intermediate values resolve as empty
//! objects, so only symbolic segments can fail.

use livedoc_core::{id_matches, Document, Error, MutationPath, PathSegment, Result};
use serde_json::Value;

/// Resolve symbolic segments of `path` against `doc`
///
/// A path without symbolic segments is returned unchanged. Fails with
/// [`Error::PathResolution`] carrying the original path when a referenced
/// element does not exist. The document is only read.
pub fn resolve_path(doc: Option<&Document>, path: &MutationPath) -> Result<MutationPath> {
    if !path.has_refs() {
        return Ok(path.clone());
    }

    let mut resolved = Vec::with_capacity(path.len());
    let mut current = doc;
    for segment in path.segments() {
        match segment {
            PathSegment::Ref(id) => {
                let (index, element) = current
                    .and_then(Value::as_array)
                    .and_then(|arr| arr.iter().enumerate().find(|(_, el)| id_matches(el, id)))
                    .ok_or_else(|| Error::PathResolution { path: path.clone() })?;
                resolved.push(PathSegment::Index(index));
                current = Some(element);
            }
            PathSegment::Literal(key) => {
                current = current.and_then(|value| child_by_key(value, key));
                resolved.push(segment.clone());
            }
            PathSegment::Index(index) => {
                current = current.and_then(|value| value.as_array()).and_then(|arr| arr.get(*index));
                resolved.push(segment.clone());
            }
        }
    }
    Ok(MutationPath::new(resolved))
}

fn child_by_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(obj) => obj.get(key),
        Value::Array(arr) => key.parse::<usize>().ok().and_then(|i| arr.get(i)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(v: Value) -> MutationPath {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_resolves_ref_to_index() {
        let doc = json!({"items": [{"_id": "a"}, {"_id": "b"}]});
        let resolved = resolve_path(Some(&doc), &path(json!(["items", "&b"]))).unwrap();
        assert_eq!(resolved, path(json!(["items", 1])));
        assert!(!resolved.has_refs());
    }

    #[test]
    fn test_nested_refs() {
        let doc = json!({
            "lists": [
                {"_id": "l1", "cards": [{"_id": "c1"}]},
                {"_id": "l2", "cards": [{"_id": "c1"}, {"_id": "c2", "title": "x"}]},
            ]
        });
        let resolved =
            resolve_path(Some(&doc), &path(json!(["lists", "&l2", "cards", "&c2", "title"]))).unwrap();
        assert_eq!(resolved, path(json!(["lists", 1, "cards", 1, "title"])));
    }

    #[test]
    fn test_first_match_wins() {
        let doc = json!({"items": [{"_id": "x"}, {"_id": "dup"}, {"_id": "dup"}]});
        let resolved = resolve_path(Some(&doc), &path(json!(["items", "&dup"]))).unwrap();
        assert_eq!(resolved, path(json!(["items", 1])));
    }

    #[test]
    fn test_numeric_identity() {
        let doc = json!({"items": [{"_id": 3}, {"_id": 7}]});
        let resolved = resolve_path(Some(&doc), &path(json!(["items", "&7"]))).unwrap();
        assert_eq!(resolved, path(json!(["items", 1])));
    }

    #[test]
    fn test_missing_ref_carries_original_path() {
        let doc = json!({"items": [{"_id": "a"}]});
        let original = path(json!(["items", "&z"]));
        match resolve_path(Some(&doc), &original) {
            Err(Error::PathResolution { path }) => assert_eq!(path, original),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ref_through_missing_or_non_array() {
        let doc = json!({"items": {"a": 1}});
        assert!(resolve_path(Some(&doc), &path(json!(["items", "&a"]))).is_err());
        assert!(resolve_path(Some(&doc), &path(json!(["nothing", "&a"]))).is_err());
        assert!(resolve_path(None, &path(json!(["items", "&a"]))).is_err());
    }

    #[test]
    fn test_plain_path_unchanged_without_document() {
        let plain = path(json!(["a", 0, "b"]));
        assert_eq!(resolve_path(None, &plain).unwrap(), plain);
    }

    #[test]
    fn test_literal_index_into_array_then_ref() {
        let doc = json!({"rows": [{"cells": [{"_id": "c"}]}]});
        let resolved = resolve_path(Some(&doc), &path(json!(["rows", "0", "cells", "&c"]))).unwrap();
        assert_eq!(resolved.to_string(), "rows.0.cells.0");
    }
}
