//! Live reconciliation driven by event-store change notifications.
//!
//! A listener is attached at the root. Each notification names a direct
//! child of a listened node: containers get their own listener, readings go
//! through the single-record pipeline. Listeners live as long as the watcher;
//! in-flight entries only as long as their handler.

use crate::pipeline::{process_record, ItemOutcome, PipelineContext};
use crate::tracker::{is_eligible, MigrationTracker};
use roadwatch_core::detector::{DetectorSet, DetectorThresholds};
use roadwatch_core::tree::{classify_node, normalize_path, LeafRecord, NodeKind};
use roadwatch_events::{ChildChange, EventStore, EventStoreError};
use roadwatch_storage::AggregateStore;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct WatcherOptions {
    pub root_path: String,
    pub thresholds: DetectorThresholds,
}

impl From<&crate::ReconcileConfig> for WatcherOptions {
    fn from(config: &crate::ReconcileConfig) -> Self {
        Self {
            root_path: config.root_path.clone(),
            thresholds: config.thresholds,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatcherStats {
    pub listeners: u64,
    pub notifications: u64,
    pub processed: u64,
    pub migrated: u64,
    pub denied: u64,
    pub errors: u64,
    pub skipped: u64,
    /// Notifications folded into a handler already running for the same leaf.
    pub coalesced: u64,
}

#[derive(Default)]
struct Counters {
    notifications: AtomicU64,
    processed: AtomicU64,
    migrated: AtomicU64,
    denied: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
    coalesced: AtomicU64,
}

type LeafKey = (String, String);

struct Shared {
    events: Arc<dyn EventStore>,
    ctx: PipelineContext,
    thresholds: DetectorThresholds,
    listeners: Mutex<BTreeSet<String>>,
    /// Leaves being handled; the flag records a notification that arrived meanwhile.
    in_flight: Mutex<HashMap<LeafKey, bool>>,
    detectors: Mutex<HashMap<String, Arc<Mutex<DetectorSet>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LiveWatcher;

impl LiveWatcher {
    /// Attaches the root listener. Must be called from within a tokio runtime.
    pub fn start(
        events: Arc<dyn EventStore>,
        aggregates: Arc<AggregateStore>,
        options: WatcherOptions,
    ) -> Result<WatcherHandle, EventStoreError> {
        let tracker = MigrationTracker::new(events.clone());
        let shared = Arc::new(Shared {
            events,
            ctx: PipelineContext {
                aggregates,
                tracker,
            },
            thresholds: options.thresholds,
            listeners: Mutex::new(BTreeSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            detectors: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            counters: Counters::default(),
        });

        let root = normalize_path(&options.root_path);
        attach(&shared, root.clone())?;
        info!(event = "watcher_started", root = %root);
        Ok(WatcherHandle { shared })
    }
}

pub struct WatcherHandle {
    shared: Arc<Shared>,
}

impl WatcherHandle {
    pub fn stats(&self) -> WatcherStats {
        let counters = &self.shared.counters;
        WatcherStats {
            listeners: lock(&self.shared.listeners).len() as u64,
            notifications: counters.notifications.load(Ordering::Relaxed),
            processed: counters.processed.load(Ordering::Relaxed),
            migrated: counters.migrated.load(Ordering::Relaxed),
            denied: counters.denied.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
        }
    }

    pub fn listener_paths(&self) -> Vec<String> {
        lock(&self.shared.listeners).iter().cloned().collect()
    }

    /// Stops every listener. Handlers already running finish on their own.
    pub fn shutdown(self) {
        let tasks: Vec<JoinHandle<()>> = lock(&self.shared.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        info!(event = "watcher_stopped", stats = ?self.stats());
    }
}

/// Subscribes below `path` unless a listener is already registered there.
fn attach(shared: &Arc<Shared>, path: String) -> Result<bool, EventStoreError> {
    if !lock(&shared.listeners).insert(path.clone()) {
        return Ok(false);
    }
    let mut subscription = match shared.events.subscribe(&path) {
        Ok(subscription) => subscription,
        Err(err) => {
            lock(&shared.listeners).remove(&path);
            return Err(err);
        }
    };

    let listener = Arc::clone(shared);
    let task = tokio::spawn(async move {
        while let Some(change) = subscription.next().await {
            listener.counters.notifications.fetch_add(1, Ordering::Relaxed);
            let handler = Arc::clone(&listener);
            tokio::spawn(async move {
                handle_change(handler, change).await;
            });
        }
    });
    lock(&shared.tasks).push(task);
    info!(event = "listener_attached", path = %path);
    Ok(true)
}

struct InFlight {
    shared: Arc<Shared>,
    key: LeafKey,
    released: bool,
}

impl InFlight {
    fn acquire(shared: &Arc<Shared>, key: LeafKey) -> Option<Self> {
        let mut in_flight = lock(&shared.in_flight);
        if let Some(rerun) = in_flight.get_mut(&key) {
            *rerun = true;
            return None;
        }
        in_flight.insert(key.clone(), false);
        Some(Self {
            shared: Arc::clone(shared),
            key,
            released: false,
        })
    }

    /// True when another notification arrived while handling; otherwise the
    /// entry is released under the same lock so no notification is lost.
    fn rerun_requested(&mut self) -> bool {
        let mut in_flight = lock(&self.shared.in_flight);
        match in_flight.get_mut(&self.key) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                in_flight.remove(&self.key);
                self.released = true;
                false
            }
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.released {
            lock(&self.shared.in_flight).remove(&self.key);
        }
    }
}

async fn handle_change(shared: Arc<Shared>, change: ChildChange) {
    let key = (change.parent.clone(), change.key.clone());
    let Some(mut flight) = InFlight::acquire(&shared, key) else {
        shared.counters.coalesced.fetch_add(1, Ordering::Relaxed);
        debug!(event = "notification_coalesced", path = %change.path());
        return;
    };

    loop {
        if let Err(err) = handle_node(&shared, &change).await {
            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(event = "leaf_failed", path = %change.path(), error = %err);
        }
        if !flight.rerun_requested() {
            break;
        }
    }
}

async fn handle_node(shared: &Arc<Shared>, change: &ChildChange) -> Result<(), WatchError> {
    let path = change.path();
    let events = Arc::clone(&shared.events);
    let read_path = path.clone();
    let node = tokio::task::spawn_blocking(move || events.read_subtree(&read_path)).await??;
    let Some(node) = node else {
        return Ok(());
    };

    match classify_node(&node) {
        NodeKind::Container => {
            attach(shared, path)?;
        }
        NodeKind::Reading => {
            if !is_eligible(&node, false) {
                shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(event = "leaf_skipped", path = %path);
                return Ok(());
            }
            let leaf = LeafRecord {
                path,
                key: change.key.clone(),
                payload: node,
            };
            let detectors = detectors_for(shared, &change.parent);
            let ctx = shared.ctx.clone();
            let item = tokio::task::spawn_blocking(move || {
                let mut detectors = lock(&detectors);
                process_record(&ctx, &leaf, &mut detectors, false)
            })
            .await?;

            let counters = &shared.counters;
            counters.processed.fetch_add(1, Ordering::Relaxed);
            match item.outcome {
                ItemOutcome::Migrated => counters.migrated.fetch_add(1, Ordering::Relaxed),
                ItemOutcome::Denied => counters.denied.fetch_add(1, Ordering::Relaxed),
                ItemOutcome::Error => counters.errors.fetch_add(1, Ordering::Relaxed),
                ItemOutcome::Skipped => counters.skipped.fetch_add(1, Ordering::Relaxed),
            };
            debug!(
                event = "leaf_processed",
                path = %item.path,
                outcome = item.outcome.as_str()
            );
        }
        NodeKind::Unrecognized => {
            debug!(event = "node_ignored", path = %path);
        }
    }
    Ok(())
}

/// One detector state per listened node, i.e. per device stream.
fn detectors_for(shared: &Shared, listener: &str) -> Arc<Mutex<DetectorSet>> {
    let mut detectors = lock(&shared.detectors);
    Arc::clone(
        detectors
            .entry(listener.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DetectorSet::new(shared.thresholds)))),
    )
}

#[derive(Debug, thiserror::Error)]
enum WatchError {
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
    #[error("handler task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use roadwatch_events::MemoryEventStore;
    use serde_json::json;

    fn shared_for(store: Arc<MemoryEventStore>) -> Arc<Shared> {
        let aggregates = Arc::new(AggregateStore::open_in_memory().expect("aggregate store"));
        Arc::new(Shared {
            events: store.clone(),
            ctx: PipelineContext {
                aggregates,
                tracker: MigrationTracker::new(store),
            },
            thresholds: DetectorThresholds::default(),
            listeners: Mutex::new(BTreeSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            detectors: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            counters: Counters::default(),
        })
    }

    #[test]
    fn in_flight_entries_coalesce_and_release() {
        let shared = shared_for(Arc::new(MemoryEventStore::new()));
        let key = ("readings".to_string(), "r1".to_string());

        let mut first = InFlight::acquire(&shared, key.clone()).expect("first acquire");
        assert!(InFlight::acquire(&shared, key.clone()).is_none());
        assert!(first.rerun_requested());
        assert!(!first.rerun_requested());
        assert!(lock(&shared.in_flight).is_empty());
        drop(first);

        let second = InFlight::acquire(&shared, key.clone()).expect("released");
        drop(second);
        assert!(lock(&shared.in_flight).is_empty());
    }

    #[test]
    fn detector_state_is_per_listener() {
        let shared = shared_for(Arc::new(MemoryEventStore::new()));
        let a = detectors_for(&shared, "readings/alice");
        let again = detectors_for(&shared, "readings/alice");
        let b = detectors_for(&shared, "readings/bob");
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn attach_registers_each_path_once() {
        let store = Arc::new(MemoryEventStore::with_tree(json!({"readings": {}})));
        let shared = shared_for(store);
        assert!(attach(&shared, "readings".to_string()).expect("attach"));
        assert!(!attach(&shared, "readings".to_string()).expect("attach again"));
        assert_eq!(lock(&shared.listeners).len(), 1);
        assert_eq!(lock(&shared.tasks).len(), 1);
        for task in lock(&shared.tasks).drain(..) {
            task.abort();
        }
    }
}
