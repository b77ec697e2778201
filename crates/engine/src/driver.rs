//! Observable driver
//!
//! The [`Driver`] trait is the seam between the session-facing database and
//! storage: `call` executes ordered writes, `ws_call` executes one read and
//! registers its query. [`ObservableDriver`] implements it over any
//! [`DocumentStore`], notifying the invalidation engine after every write and
//! annotating writes with field provenance.

use crate::engine::InvalidationEngine;
use crate::interpreter::{CollectionWriter, MutationInterpreter};
use crate::provenance::{annotate_insert, annotate_update};
use chrono::Utc;
use livedoc_core::{
    build_field_provenance, ClientPayload, Document, DocumentStore, Error, Filter, Provenance,
    QueryId, Result, Update,
};
use once_cell::sync::OnceCell;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Callback receiving the id of every query a read touches
pub type VisitId = Arc<dyn Fn(QueryId) + Send + Sync>;

/// Who is reading or writing, and how results are shaped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Label attached to observers registered without an explicit tag
    pub tag: Option<String>,
    /// Client identifier recorded in field provenance
    pub client: Option<String>,
    /// User recorded in creation and deletion stamps
    pub user: Option<String>,
    /// Return field provenance alongside read results
    pub meta: bool,
}

/// Options of one read
#[derive(Clone, Default)]
pub struct ReadOptions {
    /// Session the read belongs to
    pub session: SessionOptions,
    /// Invoked with the query id before the read runs
    pub visit_id: Option<VisitId>,
}

impl fmt::Debug for ReadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOptions")
            .field("session", &self.session)
            .field("visit_id", &self.visit_id.is_some())
            .finish()
    }
}

/// Read methods that register queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadMethod {
    /// Every matching document
    Find,
    /// The first matching document
    FindOne,
}

impl ReadMethod {
    /// Wire name, part of the query signature
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadMethod::Find => "find",
            ReadMethod::FindOne => "findOne",
        }
    }

    /// Whether the result is a single document
    pub fn single(&self) -> bool {
        matches!(self, ReadMethod::FindOne)
    }
}

/// Result of one read
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse {
    /// The registered query
    pub query_id: QueryId,
    /// An array for `find`, a document or `null` for `findOne`
    pub result: Value,
    /// `"<docId>.<field>"` provenance map, when requested
    pub meta: Option<Map<String, Value>>,
}

impl ReadResponse {
    /// Wire form: `[id, result]`, or `[id, [result, meta]]` with metadata
    pub fn to_wire(&self) -> Value {
        let id = Value::from(self.query_id.as_u64());
        match &self.meta {
            None => Value::Array(vec![id, self.result.clone()]),
            Some(meta) => Value::Array(vec![
                id,
                Value::Array(vec![self.result.clone(), Value::Object(meta.clone())]),
            ]),
        }
    }
}

/// One low-level write of a batch
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a document
    InsertOne {
        /// Target collection
        collection: String,
        /// New document
        document: Document,
    },
    /// Update the first matching document
    UpdateOne {
        /// Target collection
        collection: String,
        /// Filter document
        filter: Value,
        /// Update document (`$set`, `$unset`, `$push`, `$pull`)
        update: Value,
        /// Create the document when nothing matches
        upsert: bool,
    },
    /// Physically delete the first matching document
    DeleteOne {
        /// Target collection
        collection: String,
        /// Filter document
        filter: Value,
    },
    /// Interpret a client mutation payload
    Push(ClientPayload),
}

impl WriteOp {
    /// Parse a `[collection, method, args]` triple
    ///
    /// Unknown methods fail with [`Error::UnknownBatchMethod`].
    pub fn from_wire(triple: &Value) -> Result<Self> {
        let parts = triple
            .as_array()
            .filter(|parts| parts.len() == 3)
            .ok_or_else(|| Error::invalid_payload("batch entries are [collection, method, args]"))?;
        let collection = parts[0]
            .as_str()
            .ok_or_else(|| Error::invalid_payload("batch collection must be a string"))?
            .to_string();
        let method = parts[1]
            .as_str()
            .ok_or_else(|| Error::invalid_payload("batch method must be a string"))?;
        let args: &[Value] = match &parts[2] {
            Value::Array(args) => args.as_slice(),
            Value::Null => &[],
            other => std::slice::from_ref(other),
        };
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);

        match method {
            "insertOne" => Ok(WriteOp::InsertOne {
                collection,
                document: arg(0),
            }),
            "updateOne" => Ok(WriteOp::UpdateOne {
                collection,
                filter: arg(0),
                update: arg(1),
                upsert: args
                    .get(2)
                    .and_then(|opts| opts.get("upsert"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            "deleteOne" => Ok(WriteOp::DeleteOne {
                collection,
                filter: arg(0),
            }),
            "push" => Ok(WriteOp::Push(ClientPayload::from_wire(&arg(0))?)),
            other => Err(Error::UnknownBatchMethod(other.to_string())),
        }
    }

    /// Parse a whole batch; nothing is returned unless every entry parses
    pub fn parse_batch(operations: &Value) -> Result<Vec<Self>> {
        operations
            .as_array()
            .ok_or_else(|| Error::invalid_payload("batch must be an array"))?
            .iter()
            .map(WriteOp::from_wire)
            .collect()
    }
}

/// Storage-facing contract of the session layer
pub trait Driver: Send + Sync {
    /// Wire the invalidation engine into the driver; called once
    fn init(&self, engine: Arc<InvalidationEngine>) -> Result<()>;

    /// Execute writes in order, returning one result per operation
    ///
    /// Stops at the first failing operation; earlier operations stay applied.
    fn call(&self, options: &SessionOptions, operations: Vec<WriteOp>) -> Result<Vec<Value>>;

    /// Execute one read, excluding soft-deleted documents
    ///
    /// Registers (or looks up) the query for `(collection, method, filter)`
    /// and reports its id through `options.visit_id` before reading.
    fn ws_call(
        &self,
        options: &ReadOptions,
        collection: &str,
        method: ReadMethod,
        filter: &Value,
        debug: bool,
    ) -> Result<ReadResponse>;
}

/// [`Driver`] over a [`DocumentStore`]
pub struct ObservableDriver<S: DocumentStore> {
    store: Arc<S>,
    engine: OnceCell<Arc<InvalidationEngine>>,
}

impl<S: DocumentStore> ObservableDriver<S> {
    /// Create a driver; it must be [`init`](Driver::init)ialised before use
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            engine: OnceCell::new(),
        }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn engine(&self) -> Result<&Arc<InvalidationEngine>> {
        self.engine
            .get()
            .ok_or_else(|| Error::Config("driver used before init".to_string()))
    }

    fn provenance(&self, engine: &InvalidationEngine, client: Option<&str>) -> Option<Provenance> {
        if engine.config().provenance {
            Some(Provenance::new(client.map(str::to_string), Utc::now()))
        } else {
            None
        }
    }

    /// Insert a document and notify queries it enters
    pub fn insert_one(&self, collection: &str, mut document: Document, client: Option<&str>) -> Result<Value> {
        let engine = self.engine()?;
        if let Some(provenance) = self.provenance(engine, client) {
            annotate_insert(&mut document, &provenance)?;
        }
        let id = self.store.insert_one(collection, document)?;
        let after = self.store.find_one(collection, &Filter::by_id(&id))?;
        engine.notify(collection, None, after.as_ref());
        Ok(id)
    }

    /// Update the first document matching `filter` and notify affected queries
    ///
    /// The after snapshot is read by the identity of the touched document, so
    /// updates that move a document out of `filter` still see it.
    pub fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        mut update: Update,
        upsert: bool,
        client: Option<&str>,
    ) -> Result<Option<Value>> {
        let engine = self.engine()?;
        let before = self.store.find_one(collection, filter)?;
        if let Some(provenance) = self.provenance(engine, client) {
            annotate_update(&mut update, &provenance)?;
        }
        let outcome = self.store.update_one(collection, filter, &update, upsert)?;
        let touched = outcome.touched_id().cloned();
        let after = match &touched {
            Some(id) => self.store.find_one(collection, &Filter::by_id(id))?,
            None => None,
        };
        engine.notify(collection, before.as_ref(), after.as_ref());
        Ok(touched)
    }

    /// Physically delete the first document matching `filter` and notify
    /// queries it leaves
    pub fn delete_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        let engine = self.engine()?;
        let removed = self.store.delete_one(collection, filter)?;
        if removed.is_some() {
            engine.notify(collection, removed.as_ref(), None);
        }
        Ok(removed)
    }

    /// Interpret a client mutation payload
    pub fn push(&self, payload: &ClientPayload, options: &SessionOptions) -> Result<()> {
        let writer = ObservedCollection {
            driver: self,
            collection: &payload.collection,
            client: options.client.as_deref(),
        };
        MutationInterpreter::new(&writer, options.user.clone()).apply_payload(payload)
    }

    fn execute(&self, options: &SessionOptions, op: WriteOp) -> Result<Value> {
        let client = options.client.as_deref();
        match op {
            WriteOp::InsertOne {
                collection,
                document,
            } => self.insert_one(&collection, document, client),
            WriteOp::UpdateOne {
                collection,
                filter,
                update,
                upsert,
            } => {
                let filter = Filter::compile(&filter)?;
                let update = Update::from_wire(&update)?;
                Ok(self
                    .update_one(&collection, &filter, update, upsert, client)?
                    .unwrap_or(Value::Null))
            }
            WriteOp::DeleteOne { collection, filter } => {
                let filter = Filter::compile(&filter)?;
                Ok(Value::Bool(self.delete_one(&collection, &filter)?.is_some()))
            }
            WriteOp::Push(payload) => {
                self.push(&payload, options)?;
                Ok(Value::Bool(true))
            }
        }
    }
}

impl<S: DocumentStore> Driver for ObservableDriver<S> {
    fn init(&self, engine: Arc<InvalidationEngine>) -> Result<()> {
        self.engine
            .set(engine)
            .map_err(|_| Error::Config("driver already initialised".to_string()))
    }

    fn call(&self, options: &SessionOptions, operations: Vec<WriteOp>) -> Result<Vec<Value>> {
        debug!(
            target: "livedoc::driver",
            client = ?options.client,
            operations = operations.len(),
            "call"
        );
        operations
            .into_iter()
            .map(|op| self.execute(options, op))
            .collect()
    }

    fn ws_call(
        &self,
        options: &ReadOptions,
        collection: &str,
        method: ReadMethod,
        filter: &Value,
        debug: bool,
    ) -> Result<ReadResponse> {
        let engine = self.engine()?;
        let descriptor = engine.compile(collection, method.as_str(), filter)?;
        let query_id = descriptor.id();
        if let Some(visit) = &options.visit_id {
            visit(query_id);
        }

        let live = descriptor.filter().clone().live();
        if debug {
            debug!(
                target: "livedoc::driver",
                %query_id,
                collection,
                method = method.as_str(),
                tag = ?options.session.tag,
                filter = %live.source(),
                "read"
            );
        }

        let (result, meta) = match method {
            ReadMethod::Find => {
                let docs = self.store.find(collection, &live)?;
                let meta = options.session.meta.then(|| build_field_provenance(&docs));
                (Value::Array(docs), meta)
            }
            ReadMethod::FindOne => {
                let doc = self.store.find_one(collection, &live)?;
                let meta = options.session.meta.then(|| build_field_provenance(doc.iter()));
                (doc.unwrap_or(Value::Null), meta)
            }
        };

        Ok(ReadResponse {
            query_id,
            result,
            meta,
        })
    }
}

/// Interpreter writes routed through the driver
struct ObservedCollection<'a, S: DocumentStore> {
    driver: &'a ObservableDriver<S>,
    collection: &'a str,
    client: Option<&'a str>,
}

impl<'a, S: DocumentStore> CollectionWriter for ObservedCollection<'a, S> {
    fn find(&self, id: &Value) -> Result<Option<Document>> {
        self.driver.store.find_one(self.collection, &Filter::by_id(id))
    }

    fn update_one(&self, filter: &Filter, update: Update, upsert: bool) -> Result<()> {
        self.driver
            .update_one(self.collection, filter, update, upsert, self.client)
            .map(|_| ())
    }

    fn insert_one(&self, document: Document) -> Result<Value> {
        self.driver.insert_one(self.collection, document, self.client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use livedoc_storage::MemoryStore;
    use serde_json::json;

    fn driver() -> (ObservableDriver<MemoryStore>, Arc<InvalidationEngine>) {
        let driver = ObservableDriver::new(Arc::new(MemoryStore::new()));
        let engine = Arc::new(InvalidationEngine::new(EngineConfig::inline()));
        driver.init(Arc::clone(&engine)).unwrap();
        (driver, engine)
    }

    #[test]
    fn test_use_before_init_and_double_init() {
        let driver = ObservableDriver::new(Arc::new(MemoryStore::new()));
        let err = driver
            .ws_call(&ReadOptions::default(), "t", ReadMethod::Find, &json!({}), false)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let engine = Arc::new(InvalidationEngine::new(EngineConfig::inline()));
        driver.init(Arc::clone(&engine)).unwrap();
        assert!(driver.init(engine).is_err());
    }

    #[test]
    fn test_ws_call_registers_and_visits() {
        let (driver, engine) = driver();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<QueryId>::new()));
        let sink = Arc::clone(&seen);
        let options = ReadOptions {
            session: SessionOptions::default(),
            visit_id: Some(Arc::new(move |id: QueryId| sink.lock().push(id))),
        };

        let first = driver
            .ws_call(&options, "tasks", ReadMethod::Find, &json!({"status": "open"}), false)
            .unwrap();
        let again = driver
            .ws_call(&options, "tasks", ReadMethod::Find, &json!({"status": "open"}), true)
            .unwrap();
        assert_eq!(first.query_id, QueryId::new(1));
        assert_eq!(again.query_id, first.query_id);
        assert_eq!(*seen.lock(), vec![QueryId::new(1), QueryId::new(1)]);
        assert_eq!(engine.query_count(), 1);
        assert_eq!(first.to_wire(), json!([1, []]));
    }

    #[test]
    fn test_reads_exclude_soft_deleted() {
        let (driver, _engine) = driver();
        driver.insert_one("t", json!({"_id": "a", "k": 1}), None).unwrap();
        driver
            .insert_one("t", json!({"_id": "b", "k": 1, "_deleted": {"user": null}}), None)
            .unwrap();
        let found = driver
            .ws_call(&ReadOptions::default(), "t", ReadMethod::Find, &json!({"k": 1}), false)
            .unwrap();
        let docs = found.result.as_array().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["_id"], json!("a"));

        let one = driver
            .ws_call(&ReadOptions::default(), "t", ReadMethod::FindOne, &json!({"_id": "b"}), false)
            .unwrap();
        assert_eq!(one.result, Value::Null);
    }

    #[test]
    fn test_meta_response_shape() {
        let (driver, _engine) = driver();
        driver
            .insert_one("t", json!({"_id": "a", "title": "x"}), Some("c1"))
            .unwrap();
        let options = ReadOptions {
            session: SessionOptions {
                meta: true,
                ..SessionOptions::default()
            },
            visit_id: None,
        };
        let response = driver
            .ws_call(&options, "t", ReadMethod::FindOne, &json!({"_id": "a"}), false)
            .unwrap();
        let meta = response.meta.clone().unwrap();
        assert_eq!(meta["a.title"]["client"], json!("c1"));
        let wire = response.to_wire();
        assert_eq!(wire[0], json!(1));
        assert_eq!(wire[1][0]["title"], json!("x"));
        assert!(wire[1][1].get("a.title").is_some());
    }

    #[test]
    fn test_update_after_snapshot_by_identity() {
        let (driver, engine) = driver();
        driver.insert_one("t", json!({"_id": "a", "status": "open"}), None).unwrap();
        let closed = engine.compile("t", "find", &json!({"status": "closed"})).unwrap();
        let hits = Arc::new(parking_lot::Mutex::new(0));
        let h = Arc::clone(&hits);
        engine.observe(
            closed.id(),
            crate::observer::ObserverRef::new(move |_: &crate::observer::Invalidation| *h.lock() += 1),
            None,
        );

        let filter = Filter::compile(&json!({"status": "open"})).unwrap();
        let update = Update::from_wire(&json!({"$set": {"status": "closed"}})).unwrap();
        let touched = driver.update_one("t", &filter, update, false, None).unwrap();
        assert_eq!(touched, Some(json!("a")));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_parse_batch() {
        let ops = WriteOp::parse_batch(&json!([
            ["t", "insertOne", [{"_id": "a"}]],
            ["t", "updateOne", [{"_id": "a"}, {"$set": {"n": 1}}, {"upsert": true}]],
            ["t", "deleteOne", [{"_id": "a"}]],
            ["t", "push", [{"collection": "t", "_id": "a", "mutation": {"type": "delete"}}]],
        ]))
        .unwrap();
        assert_eq!(ops.len(), 4);
        assert!(matches!(ops[1], WriteOp::UpdateOne { upsert: true, .. }));

        let err = WriteOp::parse_batch(&json!([
            ["t", "insertOne", [{"_id": "a"}]],
            ["t", "replaceOne", [{}]],
        ]))
        .unwrap_err();
        assert_eq!(err.to_string(), "Unknown method replaceOne");
    }

    #[test]
    fn test_call_returns_ordered_results() {
        let (driver, _engine) = driver();
        let ops = WriteOp::parse_batch(&json!([
            ["t", "insertOne", [{"_id": "a", "n": 0}]],
            ["t", "updateOne", [{"_id": "a"}, {"$set": {"n": 1}}]],
            ["t", "deleteOne", [{"_id": "zzz"}]],
            ["t", "deleteOne", [{"_id": "a"}]],
        ]))
        .unwrap();
        let results = driver.call(&SessionOptions::default(), ops).unwrap();
        assert_eq!(results, vec![json!("a"), json!("a"), json!(false), json!(true)]);
    }

    #[test]
    fn test_provenance_disabled() {
        let driver = ObservableDriver::new(Arc::new(MemoryStore::new()));
        let engine = Arc::new(InvalidationEngine::new(EngineConfig {
            provenance: false,
            ..EngineConfig::inline()
        }));
        driver.init(engine).unwrap();
        driver.insert_one("t", json!({"_id": "a", "x": 1}), Some("c")).unwrap();
        let doc = driver.store().find_one("t", &Filter::by_id(&json!("a"))).unwrap().unwrap();
        assert!(doc.get("_meta").is_none());
    }
}
