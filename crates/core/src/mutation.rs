//! Mutation records and client write payloads
//!
//! A [`MutationRecord`] describes one structural edit a client wants applied
//! to a single document. Records arrive inside a [`ClientPayload`] and are
//! interpreted strictly in submission order.

use crate::error::{Error, Result};
use crate::path::{MutationPath, PathSegment};
use crate::types::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One client-initiated document edit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MutationRecord {
    /// Assign `value` at `path`, creating the document if absent
    Set {
        /// Target location
        path: MutationPath,
        /// New value
        value: Value,
    },
    /// Remove the field at `path`
    Unset {
        /// Target location
        path: MutationPath,
    },
    /// Remove an array element, by identity when `key` is given, otherwise by position
    Remove {
        /// Array location (or array element location when no `index` is given)
        path: MutationPath,
        /// Identity of the element to remove
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        /// Position of the element to remove
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    /// Insert `el` into the array at `path`
    Insert {
        /// Array location (or insert location when no `index` is given)
        path: MutationPath,
        /// Insert position
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        /// Element to insert
        el: Value,
    },
    /// Insert a new document carrying creation provenance
    Create {
        /// The new document
        document: Document,
    },
    /// Soft-delete the payload's document
    Delete,
}

/// Loosely typed record as it arrives on the wire
#[derive(Debug, Deserialize)]
struct RawMutation {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    path: Option<MutationPath>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    key: Option<Value>,
    #[serde(default)]
    index: Option<PathSegment>,
    #[serde(default)]
    el: Option<Value>,
    #[serde(default)]
    document: Option<Value>,
}

impl MutationRecord {
    /// Parse a record from its wire form
    ///
    /// Unknown `type`s fail with [`Error::UnknownMutationType`]; a known type
    /// missing a required field fails with [`Error::InvalidPayload`].
    pub fn from_wire(value: &Value) -> Result<Self> {
        let raw: RawMutation = serde_json::from_value(value.clone())?;
        let kind = raw.kind.as_str();
        let path = |raw_path: Option<MutationPath>| {
            raw_path.ok_or_else(|| Error::invalid_payload(format!("{} mutation requires a path", kind)))
        };
        let index = match raw.index {
            None => None,
            Some(PathSegment::Index(i)) => Some(i),
            Some(other) => {
                return Err(Error::invalid_payload(format!(
                    "{} mutation index must be a non-negative integer, got {}",
                    kind, other
                )))
            }
        };

        match kind {
            "set" => Ok(MutationRecord::Set {
                path: path(raw.path)?,
                value: raw.value.unwrap_or(Value::Null),
            }),
            "unset" => Ok(MutationRecord::Unset {
                path: path(raw.path)?,
            }),
            "remove" => Ok(MutationRecord::Remove {
                path: path(raw.path)?,
                key: match raw.key {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s),
                    Some(other) => Some(other.to_string()),
                },
                index,
            }),
            "insert" => Ok(MutationRecord::Insert {
                path: path(raw.path)?,
                index,
                el: raw
                    .el
                    .ok_or_else(|| Error::invalid_payload("insert mutation requires el"))?,
            }),
            "create" => match raw.document {
                Some(document @ Value::Object(_)) => Ok(MutationRecord::Create { document }),
                _ => Err(Error::invalid_payload("create mutation requires a document object")),
            },
            "delete" => Ok(MutationRecord::Delete),
            other => Err(Error::UnknownMutationType(other.to_string())),
        }
    }

    /// The wire name of this record's type
    pub fn kind(&self) -> &'static str {
        match self {
            MutationRecord::Set { .. } => "set",
            MutationRecord::Unset { .. } => "unset",
            MutationRecord::Remove { .. } => "remove",
            MutationRecord::Insert { .. } => "insert",
            MutationRecord::Create { .. } => "create",
            MutationRecord::Delete => "delete",
        }
    }

    /// The path this record addresses, if its type carries one
    pub fn path(&self) -> Option<&MutationPath> {
        match self {
            MutationRecord::Set { path, .. }
            | MutationRecord::Unset { path }
            | MutationRecord::Remove { path, .. }
            | MutationRecord::Insert { path, .. } => Some(path),
            MutationRecord::Create { .. } | MutationRecord::Delete => None,
        }
    }
}

impl<'de> Deserialize<'de> for MutationRecord {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        MutationRecord::from_wire(&value).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for MutationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path() {
            Some(path) => write!(f, "{} {}", self.kind(), path),
            None => f.write_str(self.kind()),
        }
    }
}

/// A batch of mutations against one document
///
/// Wire form: `{collection, _id, mutation | mutations}` where `mutation` is a
/// single record or an array of records.
///
/// A wire payload keeps every record up to and including the first one that
/// does not parse. The parsed prefix still runs when the payload is applied;
/// the unparsed record then fails the batch at its own position.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientPayload {
    /// Target collection
    pub collection: String,
    /// Identity of the target document
    pub id: Value,
    /// Records in submission order
    pub mutations: Vec<MutationRecord>,
    /// Wire form of the record that failed to parse, at position `mutations.len()`
    pub rejected: Option<Value>,
}

impl ClientPayload {
    /// Create a payload
    pub fn new(collection: impl Into<String>, id: impl Into<Value>, mutations: Vec<MutationRecord>) -> Self {
        ClientPayload {
            collection: collection.into(),
            id: id.into(),
            mutations,
            rejected: None,
        }
    }

    /// Number of records in the batch, the unparsed one included
    pub fn len(&self) -> usize {
        self.mutations.len() + usize::from(self.rejected.is_some())
    }

    /// Check if the batch has no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse a payload from its wire form
    ///
    /// Only the envelope must be valid here. Record errors are deferred to
    /// apply time so the records before a bad one still run.
    pub fn from_wire(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::invalid_payload("push payload must be an object"))?;
        let collection = obj
            .get("collection")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_payload("push payload requires a collection"))?
            .to_string();
        let id = obj.get("_id").cloned().unwrap_or(Value::Null);

        let records: Vec<&Value> = match (obj.get("mutation"), obj.get("mutations")) {
            (Some(Value::Array(many)), _) => many.iter().collect(),
            (Some(one), _) if !one.is_null() => vec![one],
            (_, Some(Value::Array(many))) => many.iter().collect(),
            _ => {
                return Err(Error::invalid_payload(
                    "push payload requires mutation or mutations",
                ))
            }
        };
        let mut mutations = Vec::with_capacity(records.len());
        let mut rejected = None;
        for record in records {
            match MutationRecord::from_wire(record) {
                Ok(parsed) => mutations.push(parsed),
                Err(_) => {
                    rejected = Some(record.clone());
                    break;
                }
            }
        }

        Ok(ClientPayload {
            collection,
            id,
            mutations,
            rejected,
        })
    }
}

impl Serialize for ClientPayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("collection", &self.collection)?;
        map.serialize_entry("_id", &self.id)?;
        let mut records = self
            .mutations
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(serde::ser::Error::custom)?;
        records.extend(self.rejected.iter().cloned());
        map.serialize_entry("mutations", &records)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_each_type() {
        let set = MutationRecord::from_wire(&json!({"type": "set", "path": ["title"], "value": "x"})).unwrap();
        assert_eq!(set.kind(), "set");

        let remove =
            MutationRecord::from_wire(&json!({"type": "remove", "path": ["items", "&b"]})).unwrap();
        match remove {
            MutationRecord::Remove { path, key, index } => {
                assert!(path.has_refs());
                assert_eq!(key, None);
                assert_eq!(index, None);
            }
            other => panic!("unexpected {:?}", other),
        }

        let insert = MutationRecord::from_wire(
            &json!({"type": "insert", "path": ["items"], "index": 0, "el": {"_id": "a"}}),
        )
        .unwrap();
        assert!(matches!(insert, MutationRecord::Insert { index: Some(0), .. }));

        let create =
            MutationRecord::from_wire(&json!({"type": "create", "document": {"_id": "d"}})).unwrap();
        assert!(matches!(create, MutationRecord::Create { .. }));

        assert_eq!(
            MutationRecord::from_wire(&json!({"type": "delete"})).unwrap(),
            MutationRecord::Delete
        );
    }

    #[test]
    fn test_numeric_remove_key_is_textual() {
        let remove =
            MutationRecord::from_wire(&json!({"type": "remove", "path": ["items"], "key": 7})).unwrap();
        assert!(matches!(remove, MutationRecord::Remove { key: Some(ref k), .. } if k == "7"));
    }

    #[test]
    fn test_unknown_type() {
        let err = MutationRecord::from_wire(&json!({"type": "rename", "path": ["a"]})).unwrap_err();
        assert!(matches!(err, Error::UnknownMutationType(ref t) if t == "rename"));
    }

    #[test]
    fn test_missing_fields() {
        assert!(matches!(
            MutationRecord::from_wire(&json!({"type": "set", "value": 1})),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            MutationRecord::from_wire(&json!({"type": "insert", "path": ["a"]})),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            MutationRecord::from_wire(&json!({"path": ["a"]})),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_display() {
        let record = MutationRecord::from_wire(&json!({"type": "unset", "path": ["items", "&z", "title"]})).unwrap();
        assert_eq!(record.to_string(), "unset items.&z.title");
        assert_eq!(MutationRecord::Delete.to_string(), "delete");
    }

    #[test]
    fn test_payload_single_and_many() {
        let single = ClientPayload::from_wire(&json!({
            "collection": "tasks",
            "_id": "t1",
            "mutation": {"type": "delete"},
        }))
        .unwrap();
        assert_eq!(single.mutations, vec![MutationRecord::Delete]);

        let wrapped = ClientPayload::from_wire(&json!({
            "collection": "tasks",
            "_id": "t1",
            "mutation": [{"type": "delete"}, {"type": "unset", "path": ["a"]}],
        }))
        .unwrap();
        assert_eq!(wrapped.mutations.len(), 2);

        let many = ClientPayload::from_wire(&json!({
            "collection": "tasks",
            "_id": "t1",
            "mutations": [{"type": "set", "path": ["a"], "value": 1}],
        }))
        .unwrap();
        assert_eq!(many.id, json!("t1"));
        assert_eq!(many.mutations.len(), 1);
    }

    #[test]
    fn test_payload_keeps_records_before_unknown_type() {
        let payload = ClientPayload::from_wire(&json!({
            "collection": "tasks",
            "_id": "t1",
            "mutations": [
                {"type": "delete"},
                {"type": "bogus"},
                {"type": "unset", "path": ["a"]},
            ],
        }))
        .unwrap();
        assert_eq!(payload.mutations, vec![MutationRecord::Delete]);
        assert_eq!(payload.rejected, Some(json!({"type": "bogus"})));
        assert_eq!(payload.len(), 2);

        assert_eq!(
            serde_json::to_value(&payload).unwrap()["mutations"],
            json!([{"type": "delete"}, {"type": "bogus"}])
        );
    }

    #[test]
    fn test_payload_envelope_errors() {
        assert!(matches!(
            ClientPayload::from_wire(&json!([])),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            ClientPayload::from_wire(&json!({"_id": "t1", "mutations": []})),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            ClientPayload::from_wire(&json!({"collection": "tasks", "_id": "t1"})),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_serialize_uses_wire_names() {
        let record = MutationRecord::Insert {
            path: MutationPath::default().child("items"),
            index: Some(1),
            el: json!({"_id": "a"}),
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"type": "insert", "path": ["items"], "index": 1, "el": {"_id": "a"}})
        );
        let roundtrip: MutationRecord = serde_json::from_value(serde_json::to_value(&record).unwrap()).unwrap();
        assert_eq!(roundtrip, record);
    }
}
