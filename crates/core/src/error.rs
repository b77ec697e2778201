//! Error types for livedoc
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::filter::CompilationError;
use crate::path::MutationPath;
use crate::update::UpdateError;
use serde_json::Value;
use thiserror::Error;

/// Result type alias for livedoc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types surfaced by the query, mutation and storage layers
#[derive(Debug, Error)]
pub enum Error {
    /// A query filter could not be compiled into a predicate
    #[error("Compilation error: {0}")]
    Compilation(#[from] CompilationError),

    /// A symbolic path segment did not resolve against the live document
    #[error("Can't resolve path {path}")]
    PathResolution {
        /// The original, unresolved path
        path: MutationPath,
    },

    /// A mutation record carried a `type` outside the known vocabulary
    #[error("Unknown mutation type: {0}")]
    UnknownMutationType(String),

    /// A batch operation named a method the driver does not implement
    #[error("Unknown method {0}")]
    UnknownBatchMethod(String),

    /// A wire payload was structurally invalid
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// An update document could not be parsed or applied
    #[error("Invalid update: {0}")]
    InvalidUpdate(#[from] UpdateError),

    /// Opaque failure reported by the storage backend
    #[error("Storage error: {0}")]
    Storage(String),

    /// A mutation inside a batch failed; later mutations were not applied
    #[error("Mutation {index} failed ({mutation}): {source}")]
    MutationFailed {
        /// Position of the failed mutation in its batch
        index: usize,
        /// Wire form of the offending record
        mutation: Box<Value>,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Configuration could not be read, parsed or written
    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a storage error from any displayable backend failure
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Create an invalid payload error
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Error::InvalidPayload(msg.into())
    }

    /// Returns the innermost error, unwrapping batch failure context
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::MutationFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidPayload(e.to_string())
    }
}
