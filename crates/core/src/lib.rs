//! Core types and traits for livedoc
//!
//! This crate defines the foundational types used throughout the system:
//! - Document, QueryId and the reserved field names
//! - FieldPath: dotted storage paths and JSON traversal helpers
//! - MutationPath / PathSegment: client paths with symbolic `&id` references
//! - Filter: compiled query predicates
//! - Update / UpdateOp: typed update operators (Set, Unset, Push, Pull)
//! - MutationRecord / ClientPayload: client edit requests
//! - Provenance / EditStamp: metadata side-channel records
//! - Error: Error type hierarchy
//! - DocumentStore: storage backend trait

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod error;
pub mod filter;
pub mod json;
pub mod mutation;
pub mod path;
pub mod traits;
pub mod types;
pub mod update;

pub use document::{build_field_provenance, is_soft_deleted, EditStamp, Provenance};
pub use error::{Error, Result};
pub use filter::{CompilationError, Filter};
pub use json::{
    get_at_path, get_at_path_mut, set_at_path, unset_at_path, value_type_name, values_equal,
    FieldPath, JsonPathError, PathParseError, MAX_ARRAY_PADDING,
};
pub use mutation::{ClientPayload, MutationRecord};
pub use path::{MutationPath, PathSegment};
pub use traits::{DocumentStore, UpdateOutcome};
pub use types::{
    document_id, id_matches, id_to_string, identity_key, Document, QueryId, CREATED_FIELD,
    DELETED_FIELD, ID_FIELD, META_FIELD,
};
pub use update::{PullCriterion, Update, UpdateError, UpdateOp};
