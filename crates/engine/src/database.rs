//! Session-facing database
//!
//! [`ObservableDb`] is what a session layer holds: collection handles for
//! reads and writes, `push`/`batch` for client writes, `observe` /
//! `stop_observing` for subscriptions, `tagged` for per-session options and
//! `create_read_observer` for recording which queries a render touched.
//!
//! Handles are cheap to clone; all clones share one driver and one engine.

use crate::config::EngineConfig;
use crate::driver::{Driver, ReadMethod, ReadOptions, ReadResponse, SessionOptions, VisitId, WriteOp};
use crate::engine::InvalidationEngine;
use crate::observer::ObserverRef;
use livedoc_core::{ClientPayload, Document, QueryId, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

/// Reactive database handle
#[derive(Clone)]
pub struct ObservableDb {
    driver: Arc<dyn Driver>,
    engine: Arc<InvalidationEngine>,
    options: SessionOptions,
    visit_id: Option<VisitId>,
}

impl ObservableDb {
    /// Create an engine from `config`, wire it into `driver` and return the
    /// root handle
    pub fn open(driver: Arc<dyn Driver>, config: EngineConfig) -> Result<Self> {
        Self::with_engine(driver, Arc::new(InvalidationEngine::new(config)))
    }

    /// Wire an existing engine into `driver`
    pub fn with_engine(driver: Arc<dyn Driver>, engine: Arc<InvalidationEngine>) -> Result<Self> {
        driver.init(Arc::clone(&engine))?;
        Ok(Self {
            driver,
            engine,
            options: SessionOptions::default(),
            visit_id: None,
        })
    }

    /// The shared invalidation engine
    pub fn engine(&self) -> &Arc<InvalidationEngine> {
        &self.engine
    }

    /// Options this handle reads and writes with
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Handle to a collection
    pub fn collection(&self, name: &str) -> CollectionHandle<'_> {
        CollectionHandle {
            db: self,
            name: name.to_string(),
        }
    }

    /// Handle sharing this one's engine but reading and writing with `options`
    pub fn tagged(&self, options: SessionOptions) -> ObservableDb {
        ObservableDb {
            driver: Arc::clone(&self.driver),
            engine: Arc::clone(&self.engine),
            options,
            visit_id: None,
        }
    }

    /// Scoped handle recording the id of every query it reads
    ///
    /// `options` override this handle's options field by field where set.
    pub fn create_read_observer(&self, options: SessionOptions) -> ReadObserver {
        let reads: Arc<Mutex<Vec<QueryId>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reads);
        let visit: VisitId = Arc::new(move |id: QueryId| {
            let mut reads = sink.lock();
            if !reads.contains(&id) {
                reads.push(id);
            }
        });
        let merged = SessionOptions {
            tag: options.tag.or_else(|| self.options.tag.clone()),
            client: options.client.or_else(|| self.options.client.clone()),
            user: options.user.or_else(|| self.options.user.clone()),
            meta: options.meta || self.options.meta,
        };
        ReadObserver {
            db: ObservableDb {
                driver: Arc::clone(&self.driver),
                engine: Arc::clone(&self.engine),
                options: merged,
                visit_id: Some(visit),
            },
            reads,
        }
    }

    /// Subscribe `observer` to a query
    ///
    /// Without an explicit tag the handle's session tag is used. Returns
    /// false if the observer already observes the query.
    pub fn observe(&self, id: QueryId, observer: ObserverRef, tag: Option<String>) -> bool {
        self.engine
            .observe(id, observer, tag.or_else(|| self.options.tag.clone()))
    }

    /// Remove one subscription by observer identity
    pub fn stop_observing(&self, id: QueryId, observer: &ObserverRef) -> bool {
        self.engine.stop_observing(id, observer)
    }

    /// Apply a client mutation payload
    pub fn push(&self, payload: ClientPayload) -> Result<()> {
        self.driver
            .call(&self.options, vec![WriteOp::Push(payload)])
            .map(|_| ())
    }

    /// Apply a client mutation payload in wire form
    pub fn push_wire(&self, payload: &Value) -> Result<()> {
        self.push(ClientPayload::from_wire(payload)?)
    }

    /// Execute `[collection, method, args]` triples in order
    ///
    /// Every triple is parsed before the first one runs, so an unknown method
    /// leaves the store untouched.
    pub fn batch(&self, operations: &Value) -> Result<Vec<Value>> {
        let ops = WriteOp::parse_batch(operations)?;
        self.driver.call(&self.options, ops)
    }

    fn read(&self, collection: &str, method: ReadMethod, filter: &Value, debug: bool) -> Result<ReadResponse> {
        let options = ReadOptions {
            session: self.options.clone(),
            visit_id: self.visit_id.clone(),
        };
        self.driver.ws_call(&options, collection, method, filter, debug)
    }
}

/// Reads and writes against one collection
pub struct CollectionHandle<'a> {
    db: &'a ObservableDb,
    name: String,
}

impl<'a> CollectionHandle<'a> {
    /// The collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every live document matching `filter`
    pub fn find(&self, filter: &Value) -> Result<Vec<Document>> {
        match self.db.read(&self.name, ReadMethod::Find, filter, false)?.result {
            Value::Array(docs) => Ok(docs),
            _ => Ok(Vec::new()),
        }
    }

    /// The first live document matching `filter`
    pub fn find_one(&self, filter: &Value) -> Result<Option<Document>> {
        self.find_one_debug(filter, false)
    }

    /// [`find_one`](Self::find_one), logging the effective filter when `debug`
    pub fn find_one_debug(&self, filter: &Value, debug: bool) -> Result<Option<Document>> {
        match self.db.read(&self.name, ReadMethod::FindOne, filter, debug)?.result {
            Value::Null => Ok(None),
            doc => Ok(Some(doc)),
        }
    }

    /// Full read response, including the query id and provenance map
    pub fn read(&self, method: ReadMethod, filter: &Value) -> Result<ReadResponse> {
        self.db.read(&self.name, method, filter, false)
    }

    /// Insert a document, returning its identity
    pub fn insert_one(&self, document: Document) -> Result<Value> {
        let op = WriteOp::InsertOne {
            collection: self.name.clone(),
            document,
        };
        self.single(op)
    }

    /// Update the first document matching `filter`
    ///
    /// Returns the touched document's identity, or `null` if nothing matched.
    pub fn update_one(&self, filter: &Value, update: &Value, upsert: bool) -> Result<Value> {
        let op = WriteOp::UpdateOne {
            collection: self.name.clone(),
            filter: filter.clone(),
            update: update.clone(),
            upsert,
        };
        self.single(op)
    }

    /// Physically delete the first document matching `filter`
    ///
    /// Returns whether a document was removed.
    pub fn delete_one(&self, filter: &Value) -> Result<bool> {
        let op = WriteOp::DeleteOne {
            collection: self.name.clone(),
            filter: filter.clone(),
        };
        Ok(self.single(op)?.as_bool().unwrap_or(false))
    }

    fn single(&self, op: WriteOp) -> Result<Value> {
        Ok(self
            .db
            .driver
            .call(&self.db.options, vec![op])?
            .into_iter()
            .next()
            .unwrap_or(Value::Null))
    }
}

/// Database handle recording the queries read through it
pub struct ReadObserver {
    db: ObservableDb,
    reads: Arc<Mutex<Vec<QueryId>>>,
}

impl ReadObserver {
    /// Ids of every query read so far, in first-read order, without repeats
    pub fn reads(&self) -> Vec<QueryId> {
        self.reads.lock().clone()
    }
}

impl Deref for ReadObserver {
    type Target = ObservableDb;

    fn deref(&self) -> &ObservableDb {
        &self.db
    }
}
