//! Storage layer for livedoc
//!
//! This crate implements an in-memory document backend:
//! - MemoryStore: DashMap of collections, FxHashMap of documents within
//! - Insertion-ordered reads via a per-store sequence counter
//! - Upserts seeded from filter equality conditions
//!
//! Embedders with their own database implement
//! [`livedoc_core::DocumentStore`] instead.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;

pub use memory::{Collection, MemoryStore};
