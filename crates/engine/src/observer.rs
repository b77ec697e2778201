//! Observers and the observer registry
//!
//! An [`Observer`] is anything that wants to hear about invalidations. It is
//! registered against a query id through an [`ObserverRef`], whose equality is
//! the identity of the underlying allocation: clones of one `ObserverRef` are
//! the same observer, two separately wrapped closures never are.

use dashmap::DashMap;
use livedoc_core::QueryId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// One affected query inside an [`Invalidation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryHit {
    /// The affected query
    pub query_id: QueryId,
    /// Tag the observer registered this query with
    pub tag: Option<String>,
}

/// Signal that documents may have entered or left the result sets of queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    /// Collection that was written
    pub collection: String,
    /// Every affected query this observer subscribes to, in id order
    pub hits: Vec<QueryHit>,
}

impl Invalidation {
    /// Ids of the affected queries
    pub fn query_ids(&self) -> Vec<QueryId> {
        self.hits.iter().map(|hit| hit.query_id).collect()
    }
}

/// Receives invalidations
///
/// Called from notification worker threads. A panic is caught and logged;
/// it never reaches the writer or other observers.
pub trait Observer: Send + Sync {
    /// Handle one invalidation
    fn on_invalidate(&self, invalidation: &Invalidation);
}

impl<F> Observer for F
where
    F: Fn(&Invalidation) + Send + Sync,
{
    fn on_invalidate(&self, invalidation: &Invalidation) {
        self(invalidation)
    }
}

/// Shared handle to an observer, compared by identity
#[derive(Clone)]
pub struct ObserverRef(Arc<dyn Observer>);

impl ObserverRef {
    /// Wrap an observer
    pub fn new(observer: impl Observer + 'static) -> Self {
        ObserverRef(Arc::new(observer))
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }

    /// Deliver an invalidation
    pub fn notify(&self, invalidation: &Invalidation) {
        self.0.on_invalidate(invalidation)
    }
}

impl From<Arc<dyn Observer>> for ObserverRef {
    fn from(observer: Arc<dyn Observer>) -> Self {
        ObserverRef(observer)
    }
}

impl PartialEq for ObserverRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ObserverRef {}

impl Hash for ObserverRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state)
    }
}

impl fmt::Debug for ObserverRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObserverRef({:p})", self.addr())
    }
}

/// A registered interest in a query
#[derive(Debug, Clone)]
pub struct ObserverEntry {
    /// The observer
    pub observer: ObserverRef,
    /// Caller-supplied label, echoed back in deliveries
    pub tag: Option<String>,
}

/// Observer sets keyed by query id
///
/// Each set holds at most one entry per observer identity.
#[derive(Default)]
pub struct ObserverRegistry {
    entries: DashMap<QueryId, Vec<ObserverEntry>>,
}

impl ObserverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` on `query_id`
    ///
    /// Returns false if the observer was already registered on the query; the
    /// existing entry and its tag are kept.
    pub fn observe(&self, query_id: QueryId, observer: ObserverRef, tag: Option<String>) -> bool {
        let mut set = self.entries.entry(query_id).or_default();
        if set.iter().any(|entry| entry.observer == observer) {
            return false;
        }
        set.push(ObserverEntry { observer, tag });
        true
    }

    /// Remove the entry for `observer` on `query_id`
    ///
    /// Returns whether an entry was removed.
    pub fn stop_observing(&self, query_id: QueryId, observer: &ObserverRef) -> bool {
        let removed = match self.entries.get_mut(&query_id) {
            Some(mut set) => match set.iter().position(|entry| &entry.observer == observer) {
                Some(index) => {
                    set.remove(index);
                    true
                }
                None => false,
            },
            None => false,
        };
        self.entries.remove_if(&query_id, |_, set| set.is_empty());
        removed
    }

    /// Snapshot of the entries on `query_id`
    pub fn entries(&self, query_id: QueryId) -> Vec<ObserverEntry> {
        self.entries
            .get(&query_id)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    /// Number of observers on `query_id`
    pub fn observer_count(&self, query_id: QueryId) -> usize {
        self.entries.get(&query_id).map(|set| set.len()).unwrap_or(0)
    }
}
