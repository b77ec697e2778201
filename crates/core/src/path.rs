//! Mutation paths
//!
//! Client edits address a location in a document with an ordered list of
//! segments. On the wire a segment is a string key, a numeric array index, or
//! a symbolic reference `"&<id>"` naming the array element whose identity
//! field equals `<id>`. Symbolic references must be resolved against the live
//! document before the path can be handed to the storage layer.

use crate::json::FieldPath;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix marking a symbolic array-element reference
pub const REF_PREFIX: char = '&';

/// A segment in a mutation path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Object key
    Literal(String),
    /// Array position
    Index(usize),
    /// Array element whose identity field equals the id
    Ref(String),
}

impl PathSegment {
    /// Parse a textual segment; `&id` becomes a symbolic reference
    pub fn parse(text: &str) -> Self {
        match text.strip_prefix(REF_PREFIX) {
            Some(id) => PathSegment::Ref(id.to_string()),
            None => PathSegment::Literal(text.to_string()),
        }
    }

    /// Check if this segment must be resolved before use
    pub fn is_ref(&self) -> bool {
        matches!(self, PathSegment::Ref(_))
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Literal(k) => write!(f, "{}", k),
            PathSegment::Index(i) => write!(f, "{}", i),
            PathSegment::Ref(id) => write!(f, "{}{}", REF_PREFIX, id),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(text: &str) -> Self {
        PathSegment::parse(text)
    }
}

impl From<usize> for PathSegment {
    fn from(idx: usize) -> Self {
        PathSegment::Index(idx)
    }
}

impl Serialize for PathSegment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PathSegment::Index(i) => serializer.serialize_u64(*i as u64),
            other => serializer.collect_str(other),
        }
    }
}

struct PathSegmentVisitor;

impl<'de> Visitor<'de> for PathSegmentVisitor {
    type Value = PathSegment;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string key, a non-negative index or an \"&<id>\" reference")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<PathSegment, E> {
        Ok(PathSegment::parse(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<PathSegment, E> {
        usize::try_from(v)
            .map(PathSegment::Index)
            .map_err(|_| E::custom("array index out of range"))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<PathSegment, E> {
        usize::try_from(v)
            .map(PathSegment::Index)
            .map_err(|_| E::custom("negative array index"))
    }
}

impl<'de> Deserialize<'de> for PathSegment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(PathSegmentVisitor)
    }
}

/// An ordered list of path segments as submitted by a client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationPath(Vec<PathSegment>);

impl MutationPath {
    /// Create a path from segments
    pub fn new(segments: Vec<PathSegment>) -> Self {
        MutationPath(segments)
    }

    /// Get the path segments
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the path has no segments
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check if any segment is a symbolic reference
    pub fn has_refs(&self) -> bool {
        self.0.iter().any(PathSegment::is_ref)
    }

    /// Append a segment (builder pattern)
    pub fn child(mut self, segment: impl Into<PathSegment>) -> Self {
        self.0.push(segment.into());
        self
    }

    /// Split off the last segment
    pub fn split_last(&self) -> Option<(&PathSegment, MutationPath)> {
        let (last, rest) = self.0.split_last()?;
        Some((last, MutationPath(rest.to_vec())))
    }

    /// Convert to a dotted storage path
    ///
    /// Returns `None` while symbolic references remain unresolved.
    pub fn to_field_path(&self) -> Option<FieldPath> {
        let mut segments = Vec::with_capacity(self.0.len());
        for segment in &self.0 {
            match segment {
                PathSegment::Literal(k) => segments.push(k.clone()),
                PathSegment::Index(i) => segments.push(i.to_string()),
                PathSegment::Ref(_) => return None,
            }
        }
        Some(FieldPath::from_segments(segments))
    }
}

impl From<Vec<PathSegment>> for MutationPath {
    fn from(segments: Vec<PathSegment>) -> Self {
        MutationPath(segments)
    }
}

impl fmt::Display for MutationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}
