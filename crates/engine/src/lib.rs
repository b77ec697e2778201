//! Reactive invalidation engine for livedoc
//!
//! This crate sits between a session layer and a document store:
//! - Registry: canonical, numbered queries per (collection, method, filter)
//! - Observers: subscriptions keyed by query id, compared by identity
//! - Dispatch: before/after snapshots mapped to affected queries, delivered
//!   through a bounded notification queue
//! - Mutations: client payloads resolved against live documents and
//!   translated into store updates, stamped with field provenance
//! - Driver: the `call` / `ws_call` contract over any `DocumentStore`
//! - Database: the session-facing handle (`observe`, `push`, `batch`,
//!   read observers)
//!
//! All state lives in an [`InvalidationEngine`] instance; nothing is global.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod database;
pub mod driver;
pub mod engine;
pub mod interpreter;
pub mod observer;
pub mod provenance;
pub mod queue;
pub mod registry;
pub mod resolver;

pub use config::{EngineConfig, CONFIG_FILE_NAME};
pub use database::{CollectionHandle, ObservableDb, ReadObserver};
pub use driver::{
    Driver, ObservableDriver, ReadMethod, ReadOptions, ReadResponse, SessionOptions, VisitId,
    WriteOp,
};
pub use engine::{InvalidationEngine, NotifyReport};
pub use interpreter::{CollectionWriter, MutationInterpreter};
pub use observer::{Invalidation, Observer, ObserverEntry, ObserverRef, ObserverRegistry, QueryHit};
pub use provenance::{annotate_insert, annotate_update, touched_fields};
pub use queue::{NotificationQueue, QueueStats, Scheduled};
pub use registry::{QueryDescriptor, QueryRegistry};
pub use resolver::resolve_path;
