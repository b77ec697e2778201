//! Invalidation engine
//!
//! Owns the query registry, the observer registry and the notification queue.
//! One instance is shared (behind an `Arc`) by every reader and writer of a
//! service; dropping the last handle shuts the queue down.
//!
//! On every write the engine evaluates each query registered for the written
//! collection against the before and after snapshots. A query is affected when
//! either snapshot matches, which covers documents entering, leaving and
//! changing inside a result set. Observers of all affected queries are
//! notified once each, with every affected query they subscribe to.

use crate::config::EngineConfig;
use crate::observer::{Invalidation, ObserverRef, ObserverRegistry, QueryHit};
use crate::queue::{NotificationQueue, QueueStats};
use crate::registry::{QueryDescriptor, QueryRegistry};
use livedoc_core::{Document, QueryId, Result};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Outcome of one [`InvalidationEngine::notify`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Affected queries, in id order
    pub affected: Vec<QueryId>,
    /// Distinct observers a delivery was scheduled for
    pub observers_notified: usize,
}

/// The query registry, observer registry and dispatcher of one service
pub struct InvalidationEngine {
    queries: QueryRegistry,
    observers: ObserverRegistry,
    queue: NotificationQueue,
    config: EngineConfig,
}

impl InvalidationEngine {
    /// Create an engine
    pub fn new(config: EngineConfig) -> Self {
        Self {
            queries: QueryRegistry::new(),
            observers: ObserverRegistry::new(),
            queue: NotificationQueue::new(config.dispatch_workers, config.dispatch_idle_timeout()),
            config,
        }
    }

    /// The configuration the engine was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Look up or compile the descriptor for a read
    pub fn compile(&self, collection: &str, method: &str, filter: &Value) -> Result<Arc<QueryDescriptor>> {
        self.queries.compile(collection, method, filter)
    }

    /// Descriptor by id
    pub fn descriptor(&self, id: QueryId) -> Option<Arc<QueryDescriptor>> {
        self.queries.get(id)
    }

    /// Number of registered queries
    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Register interest in a query; see [`ObserverRegistry::observe`]
    pub fn observe(&self, id: QueryId, observer: ObserverRef, tag: Option<String>) -> bool {
        self.observers.observe(id, observer, tag)
    }

    /// Remove one registration by identity
    pub fn stop_observing(&self, id: QueryId, observer: &ObserverRef) -> bool {
        self.observers.stop_observing(id, observer)
    }

    /// Number of observers on a query
    pub fn observer_count(&self, id: QueryId) -> usize {
        self.observers.observer_count(id)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Queries on `collection` whose result set may differ between the snapshots
    pub fn affected_queries(
        &self,
        collection: &str,
        before: Option<&Document>,
        after: Option<&Document>,
    ) -> Vec<QueryId> {
        self.queries
            .for_collection(collection)
            .iter()
            .filter(|descriptor| descriptor.matches(before) || descriptor.matches(after))
            .map(|descriptor| descriptor.id())
            .collect()
    }

    /// Notify observers of every query affected by a write
    ///
    /// `before` is absent for inserts, `after` for physical deletes. Returns
    /// once deliveries are scheduled; use [`drain`](Self::drain) to wait for
    /// them.
    pub fn notify(&self, collection: &str, before: Option<&Document>, after: Option<&Document>) -> NotifyReport {
        let affected = self.affected_queries(collection, before, after);
        if affected.is_empty() {
            return NotifyReport::default();
        }

        // Union the observer sets, one delivery per observer identity
        let mut slots: FxHashMap<ObserverRef, usize> = FxHashMap::default();
        let mut deliveries: Vec<(ObserverRef, Vec<QueryHit>)> = Vec::new();
        for &query_id in &affected {
            for entry in self.observers.entries(query_id) {
                let hit = QueryHit {
                    query_id,
                    tag: entry.tag,
                };
                match slots.get(&entry.observer) {
                    Some(&slot) => deliveries[slot].1.push(hit),
                    None => {
                        slots.insert(entry.observer.clone(), deliveries.len());
                        deliveries.push((entry.observer, vec![hit]));
                    }
                }
            }
        }

        debug!(
            target: "livedoc::dispatch",
            collection,
            affected = affected.len(),
            observers = deliveries.len(),
            "invalidating"
        );

        let observers_notified = deliveries.len();
        for (observer, hits) in deliveries {
            let invalidation = Invalidation {
                collection: collection.to_string(),
                hits,
            };
            self.queue.submit(move || observer.notify(&invalidation));
        }

        NotifyReport {
            affected,
            observers_notified,
        }
    }

    /// Block until every scheduled delivery has run
    pub fn drain(&self) {
        self.queue.drain();
    }

    /// Finish queued deliveries and stop the worker threads
    ///
    /// Later deliveries each run on a short-lived thread of their own.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// Delivery queue metrics
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }
}

impl Default for InvalidationEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
