//! JSON helpers for documents
//!
//! This module defines the dotted field paths used by filters and update
//! operators, and the path traversal/mutation functions the storage layer
//! applies them with:
//! - FieldPath: dotted path into a document (e.g. `items.0.title`)
//! - get_at_path / get_at_path_mut / set_at_path / unset_at_path
//! - values_equal / compare_values: document-query value semantics
//!
//! Segments are plain strings. Whether a segment addresses an object key or
//! an array element is decided by the container found at that point, so
//! `items.1` indexes an array but names key `"1"` in an object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// FieldPath
// =============================================================================

/// Error type for dotted path parsing
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathParseError {
    /// Empty segment in path
    #[error("empty segment in path at position {0}")]
    EmptySegment(usize),
}

/// A dotted path into a document
///
/// # Examples
///
/// ```
/// use livedoc_core::json::FieldPath;
///
/// let path: FieldPath = "items.0.title".parse().unwrap();
/// assert_eq!(path.len(), 3);
/// assert_eq!(path.first(), Some("items"));
/// assert_eq!(path.to_string(), "items.0.title");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Create the root path (empty path)
    pub fn root() -> Self {
        FieldPath {
            segments: Vec::new(),
        }
    }

    /// Create a path from a vector of segments
    pub fn from_segments(segments: Vec<String>) -> Self {
        FieldPath { segments }
    }

    /// Get the path segments
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Get the number of segments in the path
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Check if this is the root path
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The first segment, i.e. the top-level field this path touches
    pub fn first(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Append a segment (builder pattern)
    pub fn child(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Get the parent path (None if root)
    pub fn parent(&self) -> Option<FieldPath> {
        if self.segments.is_empty() {
            None
        } else {
            let mut parent = self.clone();
            parent.segments.pop();
            Some(parent)
        }
    }

    /// Get the last segment (None if root)
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }
}

impl FromStr for FieldPath {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(FieldPath::root());
        }
        let mut segments = Vec::new();
        let mut position = 0;
        for part in s.split('.') {
            if part.is_empty() {
                return Err(PathParseError::EmptySegment(position));
            }
            position += part.len() + 1;
            segments.push(part.to_string());
        }
        Ok(FieldPath { segments })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

// =============================================================================
// Path Operations Error
// =============================================================================

/// Error type for path operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JsonPathError {
    /// Type mismatch during path traversal
    #[error("type mismatch at '{segment}': expected {expected}, found {found}")]
    TypeMismatch {
        /// Segment being traversed
        segment: String,
        /// Expected type
        expected: &'static str,
        /// Actual type found
        found: &'static str,
    },

    /// Array index too far past the end of the array to pad up to
    #[error("index {index} at '{segment}' is out of range for an array of length {len}")]
    IndexOutOfRange {
        /// Segment being traversed
        segment: String,
        /// Requested index
        index: usize,
        /// Current array length
        len: usize,
    },
}

/// How many null slots a write past the end of an array may add
pub const MAX_ARRAY_PADDING: usize = 1024;

/// Helper to get type name for error messages
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Grow `arr` with nulls so `idx` is a valid slot, within [`MAX_ARRAY_PADDING`]
fn pad_to(arr: &mut Vec<Value>, idx: usize, segment: &str) -> Result<(), JsonPathError> {
    if idx < arr.len() {
        return Ok(());
    }
    if idx - arr.len() >= MAX_ARRAY_PADDING {
        return Err(JsonPathError::IndexOutOfRange {
            segment: segment.to_string(),
            index: idx,
            len: arr.len(),
        });
    }
    arr.resize(idx + 1, Value::Null);
    Ok(())
}

fn parse_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

// =============================================================================
// Path Traversal
// =============================================================================

/// Get value at path within a document
///
/// Returns `None` if the path doesn't exist or crosses a scalar.
///
/// # Examples
///
/// ```
/// use livedoc_core::json::{get_at_path, FieldPath};
/// use serde_json::json;
///
/// let doc = json!({"items": [{"title": "a"}, {"title": "b"}]});
/// let path: FieldPath = "items.1.title".parse().unwrap();
/// assert_eq!(get_at_path(&doc, &path), Some(&json!("b")));
/// ```
pub fn get_at_path<'a>(value: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.segments() {
        current = match current {
            Value::Object(obj) => obj.get(segment)?,
            Value::Array(arr) => arr.get(parse_index(segment)?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Get mutable reference to value at path within a document
pub fn get_at_path_mut<'a>(value: &'a mut Value, path: &FieldPath) -> Option<&'a mut Value> {
    let mut current = value;
    for segment in path.segments() {
        current = match current {
            Value::Object(obj) => obj.get_mut(segment)?,
            Value::Array(arr) => arr.get_mut(parse_index(segment)?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Walk to the container holding the last segment, creating missing objects
fn parent_container<'a>(
    root: &'a mut Value,
    parent_segments: &[String],
) -> Result<&'a mut Value, JsonPathError> {
    let mut current = root;
    for segment in parent_segments {
        current = match current {
            Value::Object(obj) => obj
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(arr) => {
                let idx = parse_index(segment).ok_or_else(|| JsonPathError::TypeMismatch {
                    segment: segment.clone(),
                    expected: "object",
                    found: "array",
                })?;
                pad_to(arr, idx, segment)?;
                let slot = &mut arr[idx];
                if slot.is_null() {
                    *slot = Value::Object(Map::new());
                }
                slot
            }
            other => {
                return Err(JsonPathError::TypeMismatch {
                    segment: segment.clone(),
                    expected: "object",
                    found: value_type_name(other),
                })
            }
        };
    }
    Ok(current)
}

// =============================================================================
// Path Mutation
// =============================================================================

/// Set value at path within a document
///
/// Creates intermediate objects as needed. Setting an array index past the
/// end pads the array with nulls, at most [`MAX_ARRAY_PADDING`] of them;
/// further out fails with [`JsonPathError::IndexOutOfRange`]. Setting the
/// root path replaces the value.
///
/// # Examples
///
/// ```
/// use livedoc_core::json::{get_at_path, set_at_path, FieldPath};
/// use serde_json::json;
///
/// let mut doc = json!({});
/// let path: FieldPath = "profile.name".parse().unwrap();
/// set_at_path(&mut doc, &path, json!("Alice")).unwrap();
/// assert_eq!(doc, json!({"profile": {"name": "Alice"}}));
/// ```
pub fn set_at_path(root: &mut Value, path: &FieldPath, value: Value) -> Result<(), JsonPathError> {
    let segments = path.segments();
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return Ok(());
    };

    let container = parent_container(root, parents)?;
    match container {
        Value::Object(obj) => {
            obj.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(arr) => {
            let idx = parse_index(last).ok_or_else(|| JsonPathError::TypeMismatch {
                segment: last.clone(),
                expected: "object",
                found: "array",
            })?;
            pad_to(arr, idx, last)?;
            arr[idx] = value;
            Ok(())
        }
        other => Err(JsonPathError::TypeMismatch {
            segment: last.clone(),
            expected: "object",
            found: value_type_name(other),
        }),
    }
}

/// Remove the field at path within a document
///
/// Object keys are removed. Array slots are nulled rather than removed so
/// the positions of later elements stay put. Missing paths are a no-op.
///
/// # Returns
///
/// * `Ok(Some(value))` - The removed value
/// * `Ok(None)` - The path didn't exist
pub fn unset_at_path(root: &mut Value, path: &FieldPath) -> Result<Option<Value>, JsonPathError> {
    let Some(parent_path) = path.parent() else {
        return Ok(Some(std::mem::take(root)));
    };
    let Some(last) = path.last_segment() else {
        return Ok(None);
    };
    let Some(parent) = get_at_path_mut(root, &parent_path) else {
        return Ok(None);
    };

    match parent {
        Value::Object(obj) => Ok(obj.remove(last)),
        Value::Array(arr) => match parse_index(last) {
            Some(idx) if idx < arr.len() => Ok(Some(std::mem::take(&mut arr[idx]))),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

// =============================================================================
// Value Semantics
// =============================================================================

/// Deep equality with numeric values compared by magnitude
///
/// `1` and `1.0` are equal; object key order is irrelevant.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Order two values of the same kind
///
/// Numbers, strings and booleans are comparable with themselves; any other
/// pairing is unordered and fails every range operator.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
