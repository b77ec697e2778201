//! Concurrency and Property Tests
//!
//! Query registration races, concurrent writers with worker delivery, writes
//! racing mutation path resolution, and the completeness/soundness property of
//! invalidation.

use livedoc_core::{
    Document, DocumentStore, FieldPath, Filter, MutationRecord, QueryId, Result, Update,
};
use livedoc_engine::{
    CollectionWriter, EngineConfig, Invalidation, InvalidationEngine, MutationInterpreter,
    ObservableDb, ObservableDriver, ObserverRef, ReadMethod,
};
use livedoc_storage::MemoryStore;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn open(config: EngineConfig) -> ObservableDb {
    let driver = Arc::new(ObservableDriver::new(Arc::new(MemoryStore::new())));
    ObservableDb::open(driver, config).unwrap()
}

// ============================================================================
// Registration races
// ============================================================================

/// Test: Threads compiling the same read agree on one id
#[test]
fn test_concurrent_compile_single_id() {
    let engine = Arc::new(InvalidationEngine::new(EngineConfig::inline()));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine
                    .compile("tasks", "find", &json!({"status": "open"}))
                    .unwrap()
                    .id()
            })
        })
        .collect();

    let ids: BTreeSet<QueryId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(engine.query_count(), 1);
}

/// Test: Distinct reads from many threads get distinct, dense ids
#[test]
fn test_concurrent_distinct_compiles() {
    let engine = Arc::new(InvalidationEngine::new(EngineConfig::inline()));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                (0..25)
                    .map(|i| {
                        engine
                            .compile("tasks", "find", &json!({"thread": t, "i": i}))
                            .unwrap()
                            .id()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let ids: BTreeSet<QueryId> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(ids.len(), 100);
    assert_eq!(ids.iter().next().copied(), Some(QueryId::new(1)));
    assert_eq!(ids.iter().last().copied(), Some(QueryId::new(100)));
}

// ============================================================================
// Concurrent writers
// ============================================================================

/// Test: Every insert from every writer reaches the observer once
#[test]
fn test_concurrent_writers_all_delivered() {
    let db = open(EngineConfig::default());
    let q = db
        .collection("events")
        .read(ReadMethod::Find, &json!({}))
        .unwrap()
        .query_id;
    let delivered = Arc::new(AtomicUsize::new(0));
    let d = Arc::clone(&delivered);
    db.observe(
        q,
        ObserverRef::new(move |_: &Invalidation| {
            d.fetch_add(1, Ordering::Relaxed);
        }),
        None,
    );

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = db.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..50 {
                    db.collection("events")
                        .insert_one(json!({"writer": t, "seq": i}))
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    db.engine().drain();
    assert_eq!(delivered.load(Ordering::Relaxed), 200);
    assert_eq!(db.collection("events").find(&json!({})).unwrap().len(), 200);
}

/// Test: Concurrent pushes to one document all land
#[test]
fn test_concurrent_pushes_to_one_array() {
    let db = open(EngineConfig::inline());
    db.collection("docs")
        .insert_one(json!({"_id": "d", "items": []}))
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = db.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    db.push_wire(&json!({
                        "collection": "docs",
                        "_id": "d",
                        "mutation": {
                            "type": "insert",
                            "path": ["items"],
                            "el": {"_id": format!("{}-{}", t, i)},
                        },
                    }))
                    .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let doc = db.collection("docs").find_one(&json!({"_id": "d"})).unwrap().unwrap();
    assert_eq!(doc["items"].as_array().unwrap().len(), 40);
}

// ============================================================================
// Writes racing path resolution
// ============================================================================

/// Writer whose first read is followed by another client inserting at the
/// front of `items`, before the interpreter's write lands
struct ShiftingWriter {
    store: MemoryStore,
    shifted: AtomicBool,
}

impl ShiftingWriter {
    fn with(doc: Value) -> Self {
        let store = MemoryStore::new();
        store.insert_one("docs", doc).unwrap();
        Self {
            store,
            shifted: AtomicBool::new(false),
        }
    }

    fn items(&self) -> Value {
        self.store
            .find_one("docs", &Filter::by_id(&json!("d")))
            .unwrap()
            .map(|doc| doc["items"].clone())
            .unwrap_or(Value::Null)
    }
}

impl CollectionWriter for ShiftingWriter {
    fn find(&self, id: &Value) -> Result<Option<Document>> {
        let snapshot = self.store.find_one("docs", &Filter::by_id(id))?;
        if !self.shifted.swap(true, Ordering::SeqCst) {
            let items: FieldPath = "items".parse().unwrap();
            let front = Update::new().push(items, vec![json!({"_id": "z"})], Some(0));
            self.store.update_one("docs", &Filter::by_id(id), &front, false)?;
        }
        Ok(snapshot)
    }

    fn update_one(&self, filter: &Filter, update: Update, upsert: bool) -> Result<()> {
        self.store.update_one("docs", filter, &update, upsert).map(|_| ())
    }

    fn insert_one(&self, document: Document) -> Result<Value> {
        self.store.insert_one("docs", document)
    }
}

fn apply_racing(writer: &ShiftingWriter, wire: Value) {
    let record = MutationRecord::from_wire(&wire).unwrap();
    MutationInterpreter::new(writer, None)
        .apply(&json!("d"), &record)
        .unwrap();
}

/// Test: A set resolved before a shift lands on whatever now holds the index
#[test]
fn test_set_lands_on_shifted_slot() {
    let writer = ShiftingWriter::with(json!({"_id": "d", "items": [{"_id": "a"}, {"_id": "b"}]}));
    apply_racing(
        &writer,
        json!({"type": "set", "path": ["items", "&b", "title"], "value": "B"}),
    );
    assert_eq!(
        writer.items(),
        json!([{"_id": "z"}, {"_id": "a", "title": "B"}, {"_id": "b"}])
    );
}

/// Test: A positional remove racing a shift still removes exactly one element
#[test]
fn test_sentinel_remove_after_shift_removes_one_element() {
    let writer = ShiftingWriter::with(json!({"_id": "d", "items": [{"_id": "a"}, {"_id": "b"}]}));
    apply_racing(&writer, json!({"type": "remove", "path": ["items", "&b"]}));

    let items = writer.items();
    let items = items.as_array().unwrap();
    assert_eq!(items.len(), 2);
    // The shifted slot held "a", so "a" is the one removed
    assert_eq!(items, &vec![json!({"_id": "z"}), json!({"_id": "b"})]);
    assert!(items.iter().all(|el| el.is_object()));
}

// ============================================================================
// Invalidation property
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Moving a document from bucket `from` to bucket `to` notifies exactly
    /// the queries for `from` and `to`
    #[test]
    fn prop_update_notifies_exactly_matching_queries(from in 0i64..5, to in 0i64..5) {
        let db = open(EngineConfig::inline());
        let log: Arc<Mutex<BTreeSet<QueryId>>> = Arc::new(Mutex::new(BTreeSet::new()));
        let sink = Arc::clone(&log);
        let observer = ObserverRef::new(move |inv: &Invalidation| sink.lock().extend(inv.query_ids()));

        let buckets: Vec<QueryId> = (0..5)
            .map(|k| {
                db.collection("items")
                    .read(ReadMethod::Find, &json!({"bucket": k}))
                    .unwrap()
                    .query_id
            })
            .collect();
        for id in &buckets {
            db.observe(*id, observer.clone(), None);
        }

        let id = db.collection("items").insert_one(json!({"bucket": from})).unwrap();
        log.lock().clear();

        db.collection("items")
            .update_one(&json!({"_id": id}), &json!({"$set": {"bucket": to}}), false)
            .unwrap();

        let expected: BTreeSet<QueryId> =
            [buckets[from as usize], buckets[to as usize]].into_iter().collect();
        prop_assert_eq!(log.lock().clone(), expected);
    }

    /// Inserts notify exactly the queries whose filter the new document matches
    #[test]
    fn prop_insert_notifies_matching_queries(bucket in 0i64..5, flag in any::<bool>()) {
        let engine = InvalidationEngine::new(EngineConfig::inline());
        let by_bucket: Vec<QueryId> = (0..5)
            .map(|k| engine.compile("items", "find", &json!({"bucket": k})).unwrap().id())
            .collect();
        let flagged = engine.compile("items", "find", &json!({"flag": true})).unwrap().id();

        let doc = json!({"_id": "x", "bucket": bucket, "flag": flag});
        let affected = engine.affected_queries("items", None, Some(&doc));

        let mut expected = vec![by_bucket[bucket as usize]];
        if flag {
            expected.push(flagged);
        }
        prop_assert_eq!(affected, expected);
    }
}
