//! Invalidation Dispatch Tests
//!
//! Writes through the session-facing database notify exactly the observers
//! of queries whose result sets the write can change.

use livedoc_engine::{
    EngineConfig, Invalidation, ObservableDb, ObservableDriver, ObserverRef, ReadMethod,
    SessionOptions,
};
use livedoc_core::QueryId;
use livedoc_storage::MemoryStore;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

type Log = Arc<Mutex<Vec<Vec<QueryId>>>>;

fn open(config: EngineConfig) -> ObservableDb {
    let driver = Arc::new(ObservableDriver::new(Arc::new(MemoryStore::new())));
    ObservableDb::open(driver, config).unwrap()
}

fn recorder() -> (ObserverRef, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let observer = ObserverRef::new(move |inv: &Invalidation| sink.lock().push(inv.query_ids()));
    (observer, log)
}

fn register(db: &ObservableDb, collection: &str, filter: serde_json::Value) -> QueryId {
    db.collection(collection)
        .read(ReadMethod::Find, &filter)
        .unwrap()
        .query_id
}

// ============================================================================
// Result-set membership
// ============================================================================

#[test]
fn test_insert_notifies_matching_query_only() {
    let db = open(EngineConfig::inline());
    let open_id = register(&db, "tasks", json!({"status": "open"}));
    assert_eq!(open_id, QueryId::new(1));

    let (observer, log) = recorder();
    db.observe(open_id, observer, None);

    db.collection("tasks").insert_one(json!({"status": "open"})).unwrap();
    assert_eq!(*log.lock(), vec![vec![open_id]]);

    db.collection("tasks").insert_one(json!({"status": "closed"})).unwrap();
    assert_eq!(log.lock().len(), 1);
}

#[test]
fn test_update_notifies_leaving_and_entering_queries() {
    let db = open(EngineConfig::inline());
    let open_id = register(&db, "tasks", json!({"status": "open"}));
    let closed_id = register(&db, "tasks", json!({"status": "closed"}));
    assert_eq!(closed_id, QueryId::new(2));

    let tasks = db.collection("tasks");
    let id = tasks.insert_one(json!({"status": "open"})).unwrap();

    let (open_observer, open_log) = recorder();
    let (closed_observer, closed_log) = recorder();
    db.observe(open_id, open_observer, None);
    db.observe(closed_id, closed_observer, None);

    tasks
        .update_one(&json!({"_id": id}), &json!({"$set": {"status": "closed"}}), false)
        .unwrap();
    assert_eq!(*open_log.lock(), vec![vec![open_id]]);
    assert_eq!(*closed_log.lock(), vec![vec![closed_id]]);
}

#[test]
fn test_unrelated_collection_not_notified() {
    let db = open(EngineConfig::inline());
    let q = register(&db, "tasks", json!({}));
    let (observer, log) = recorder();
    db.observe(q, observer, None);

    db.collection("notes").insert_one(json!({"status": "open"})).unwrap();
    assert!(log.lock().is_empty());
}

#[test]
fn test_delete_notifies_query_it_leaves() {
    let db = open(EngineConfig::inline());
    let tasks = db.collection("tasks");
    let id = tasks.insert_one(json!({"status": "open"})).unwrap();
    let q = register(&db, "tasks", json!({"status": "open"}));
    let (observer, log) = recorder();
    db.observe(q, observer, None);

    assert!(tasks.delete_one(&json!({"_id": id})).unwrap());
    assert_eq!(log.lock().len(), 1);

    // Nothing removed, nothing to report
    assert!(!tasks.delete_one(&json!({"status": "open"})).unwrap());
    assert_eq!(log.lock().len(), 1);
}

// ============================================================================
// Observer bookkeeping
// ============================================================================

#[test]
fn test_observer_on_two_affected_queries_runs_once() {
    let db = open(EngineConfig::inline());
    let all = register(&db, "tasks", json!({}));
    let open_id = register(&db, "tasks", json!({"status": "open"}));

    let (observer, log) = recorder();
    db.observe(all, observer.clone(), None);
    db.observe(open_id, observer, None);

    db.collection("tasks").insert_one(json!({"status": "open"})).unwrap();
    assert_eq!(*log.lock(), vec![vec![all, open_id]]);
}

#[test]
fn test_duplicate_observe_and_stop_observing() {
    let db = open(EngineConfig::inline());
    let q = register(&db, "tasks", json!({}));
    let (observer, log) = recorder();

    assert!(db.observe(q, observer.clone(), None));
    assert!(!db.observe(q, observer.clone(), Some("again".to_string())));
    assert_eq!(db.engine().observer_count(q), 1);

    db.collection("tasks").insert_one(json!({"n": 1})).unwrap();
    assert_eq!(log.lock().len(), 1);

    assert!(db.stop_observing(q, &observer));
    assert!(!db.stop_observing(q, &observer));
    db.collection("tasks").insert_one(json!({"n": 2})).unwrap();
    assert_eq!(log.lock().len(), 1);
}

#[test]
fn test_equal_closures_are_distinct_observers() {
    let db = open(EngineConfig::inline());
    let q = register(&db, "tasks", json!({}));
    let (first, first_log) = recorder();
    let (second, second_log) = recorder();
    db.observe(q, first.clone(), None);
    db.observe(q, second, None);

    db.stop_observing(q, &first);
    db.collection("tasks").insert_one(json!({})).unwrap();
    assert!(first_log.lock().is_empty());
    assert_eq!(second_log.lock().len(), 1);
}

#[test]
fn test_session_tag_reaches_observer() {
    let db = open(EngineConfig::inline());
    let session = db.tagged(SessionOptions {
        tag: Some("board".to_string()),
        ..SessionOptions::default()
    });
    let q = register(&session, "cards", json!({}));

    let tags = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&tags);
    let observer = ObserverRef::new(move |inv: &Invalidation| {
        sink.lock().extend(inv.hits.iter().map(|hit| hit.tag.clone()));
    });
    session.observe(q, observer.clone(), None);
    db.collection("cards").insert_one(json!({})).unwrap();
    assert_eq!(*tags.lock(), vec![Some("board".to_string())]);

    // An explicit tag wins over the session tag
    session.stop_observing(q, &observer);
    session.observe(q, observer, Some("explicit".to_string()));
    db.collection("cards").insert_one(json!({})).unwrap();
    assert_eq!(tags.lock()[1], Some("explicit".to_string()));
}

#[test]
fn test_read_observer_collects_render_queries() {
    let db = open(EngineConfig::inline());
    let render = db.create_read_observer(SessionOptions::default());
    render.collection("boards").find_one(&json!({"_id": "b1"})).unwrap();
    render.collection("cards").find(&json!({"board": "b1"})).unwrap();
    render.collection("boards").find_one(&json!({"_id": "b1"})).unwrap();

    let reads = render.reads();
    assert_eq!(reads.len(), 2);

    let (observer, log) = recorder();
    for id in &reads {
        render.observe(*id, observer.clone(), None);
    }
    db.collection("cards").insert_one(json!({"board": "b1"})).unwrap();
    assert_eq!(*log.lock(), vec![vec![reads[1]]]);
}

// ============================================================================
// Failure isolation and completion
// ============================================================================

#[test]
fn test_panicking_observer_isolated_on_workers() {
    let db = open(EngineConfig::default());
    let q = register(&db, "tasks", json!({}));
    db.observe(q, ObserverRef::new(|_: &Invalidation| panic!("observer bug")), None);
    let (observer, log) = recorder();
    db.observe(q, observer, None);

    db.collection("tasks").insert_one(json!({})).unwrap();
    db.collection("tasks").insert_one(json!({})).unwrap();
    db.engine().drain();

    assert_eq!(log.lock().len(), 2);
    let stats = db.engine().queue_stats();
    assert_eq!(stats.tasks_panicked, 2);
    assert_eq!(stats.tasks_completed, 4);
}

#[test]
fn test_panicking_observer_isolated_inline() {
    let db = open(EngineConfig::inline());
    let q = register(&db, "tasks", json!({}));
    db.observe(q, ObserverRef::new(|_: &Invalidation| panic!("observer bug")), None);
    let (observer, log) = recorder();
    db.observe(q, observer, None);

    let id = db.collection("tasks").insert_one(json!({})).unwrap();
    assert!(id.is_string());
    assert_eq!(log.lock().len(), 1);
}

#[test]
fn test_blocked_observers_do_not_starve_others() {
    let db = open(EngineConfig::default());
    let q = register(&db, "tasks", json!({}));

    let release = Arc::new(Barrier::new(3));
    for _ in 0..2 {
        let r = Arc::clone(&release);
        db.observe(q, ObserverRef::new(move |_: &Invalidation| {
            r.wait();
        }), None);
    }
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    db.observe(q, ObserverRef::new(move |inv: &Invalidation| {
        let _ = tx.lock().send(inv.query_ids());
    }), None);

    db.collection("tasks").insert_one(json!({})).unwrap();
    let delivered = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("healthy observer starved by blocked ones");
    assert_eq!(delivered, vec![q]);
    assert_eq!(db.engine().queue_stats().inline_runs, 0);

    release.wait();
    db.engine().drain();
    assert_eq!(db.engine().queue_stats().tasks_completed, 3);
}

#[test]
fn test_shutdown_still_delivers_off_the_writer_thread() {
    let db = open(EngineConfig::default());
    let q = register(&db, "tasks", json!({}));
    let writer = thread::current().id();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    db.observe(q, ObserverRef::new(move |_: &Invalidation| {
        sink.lock().push(thread::current().id());
    }), None);

    db.engine().shutdown();
    db.collection("tasks").insert_one(json!({})).unwrap();
    db.engine().drain();
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_ne!(seen[0], writer);
    assert_eq!(db.engine().queue_stats().inline_runs, 0);
}
