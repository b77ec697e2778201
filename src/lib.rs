//! livedoc - reactive invalidation over a mutable document store
//!
//! Readers register queries as they read; writers report every change; the
//! engine tells exactly the observers whose query results may have changed
//! which queries to re-run.
//!
//! # Quick Start
//!
//! ```
//! use livedoc::{EngineConfig, Invalidation, MemoryStore, ObservableDb, ObservableDriver, ObserverRef};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let driver = Arc::new(ObservableDriver::new(Arc::new(MemoryStore::new())));
//! let db = ObservableDb::open(driver, EngineConfig::inline())?;
//!
//! // Reading through a read observer records the query it ran
//! let render = db.create_read_observer(Default::default());
//! render.collection("tasks").find(&json!({"status": "open"}))?;
//!
//! for id in render.reads() {
//!     db.observe(id, ObserverRef::new(|inv: &Invalidation| println!("re-run {:?}", inv.query_ids())), None);
//! }
//!
//! // Any write that can change the result set notifies the observer
//! db.collection("tasks").insert_one(json!({"status": "open"}))?;
//! # Ok::<(), livedoc::Error>(())
//! ```
//!
//! # Architecture
//!
//! - [`livedoc_core`]: documents, filters, update operators, mutation records
//!   and the [`DocumentStore`] contract
//! - [`livedoc_storage`]: the in-memory [`MemoryStore`]
//! - [`livedoc_engine`]: query and observer registries, dispatch, mutation
//!   interpretation, provenance, the driver and the session-facing database

pub use livedoc_core::*;
pub use livedoc_engine::*;
pub use livedoc_storage::*;
