use roadwatch_core::Severity;
use roadwatch_events::{EventStore, FsEventStore, MemoryEventStore};
use roadwatch_reconcile::{LiveWatcher, ReconcileConfig, WatcherHandle, WatcherOptions};
use roadwatch_storage::AggregateStore;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn options() -> WatcherOptions {
    WatcherOptions::from(&ReconcileConfig::default())
}

fn start(events: Arc<dyn EventStore>) -> (WatcherHandle, Arc<AggregateStore>) {
    let aggregates = Arc::new(AggregateStore::open_in_memory().expect("aggregate store"));
    let handle = LiveWatcher::start(events, aggregates.clone(), options()).expect("start watcher");
    (handle, aggregates)
}

async fn wait_for<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn status(store: &dyn EventStore, path: &str) -> Option<String> {
    store
        .read_subtree(path)
        .ok()
        .flatten()
        .and_then(|record| record["migration"]["status"].as_str().map(str::to_string))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_containers_are_discovered_lazily() {
    let store = Arc::new(MemoryEventStore::new());
    let (handle, aggregates) = start(store.clone());
    assert_eq!(handle.listener_paths(), vec!["readings".to_string()]);

    store
        .put(
            "readings/alice/2026-03-01/r1",
            json!({"lat": 12.9, "lng": 77.5, "potholeFlag": true, "zCorrected": 10}),
        )
        .expect("device write");

    wait_for("nested reading to migrate", || {
        status(store.as_ref(), "readings/alice/2026-03-01/r1").as_deref() == Some("migrated")
    })
    .await;

    let listeners = handle.listener_paths();
    assert!(listeners.contains(&"readings/alice".to_string()));
    assert!(listeners.contains(&"readings/alice/2026-03-01".to_string()));

    let cell = aggregates
        .location("12.9000_77.5000")
        .expect("query")
        .expect("row");
    assert_eq!(cell.highest_severity, Severity::High);
    assert_eq!(handle.stats().migrated, 1);
    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn existing_records_are_replayed_and_terminal_ones_skipped() {
    let store = Arc::new(MemoryEventStore::with_tree(json!({
        "readings": {
            "done": {"lat": 1.0, "lng": 1.0, "potholeFlag": true, "migration": {"status": "migrated"}},
            "fresh": {"lat": 2.0, "lng": 2.0, "patchyFlag": true}
        }
    })));
    let (handle, aggregates) = start(store.clone());

    wait_for("fresh record to migrate", || {
        status(store.as_ref(), "readings/fresh").as_deref() == Some("migrated")
    })
    .await;
    wait_for("terminal record to be skipped", || handle.stats().skipped >= 1).await;

    assert_eq!(aggregates.location_count().expect("count"), 1);
    assert!(aggregates
        .location("1.0000_1.0000")
        .expect("query")
        .is_none());
    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_readings_do_not_stop_the_watcher() {
    let store = Arc::new(MemoryEventStore::new());
    let (handle, aggregates) = start(store.clone());

    store
        .put("readings/bad", json!({"lat": 0, "lng": 0, "vibration": 10}))
        .expect("bad write");
    store
        .put("readings/broken", json!({"lat": "north", "lng": 77.5, "potholeFlag": true}))
        .expect("broken write");
    wait_for("bad records to be denied", || {
        status(store.as_ref(), "readings/bad").as_deref() == Some("denied")
            && status(store.as_ref(), "readings/broken").as_deref() == Some("denied")
    })
    .await;

    store
        .put("readings/good", json!({"lat": 12.9, "lng": 77.5, "potholeFlag": true}))
        .expect("good write");
    wait_for("good record to migrate", || {
        status(store.as_ref(), "readings/good").as_deref() == Some("migrated")
    })
    .await;

    let bad = store
        .read_subtree("readings/bad")
        .expect("read")
        .expect("present");
    assert_eq!(bad["migration"]["error"], "gps_not_locked_or_zero_coords");
    assert_eq!(aggregates.location_count().expect("count"), 1);
    assert!(handle.stats().denied >= 2);
    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_notifications_aggregate_once() {
    let store = Arc::new(MemoryEventStore::new());
    let (handle, aggregates) = start(store.clone());

    store
        .put("readings/r1", json!({"lat": 12.9, "lng": 77.5, "potholeFlag": true}))
        .expect("device write");
    for attempt in 0..5 {
        let mut patch = Map::new();
        patch.insert("retry".to_string(), Value::from(attempt));
        store.merge_update("readings/r1", &patch).expect("device retry");
    }

    wait_for("record to migrate", || {
        status(store.as_ref(), "readings/r1").as_deref() == Some("migrated")
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let cell = aggregates
        .location("12.9000_77.5000")
        .expect("query")
        .expect("row");
    assert_eq!(cell.report_count, 1);
    assert_eq!(handle.stats().migrated, 1);
    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_backed_store_is_watched_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FsEventStore::open(dir.path()).expect("open store"));
    store
        .put(
            "readings/alice/r1",
            &json!({"lat": 12.9, "lng": 77.5, "potholeFlag": true, "zCorrected": 7.5}),
        )
        .expect("existing record");
    let (handle, aggregates) = start(store.clone());

    wait_for("existing record to migrate", || {
        status(store.as_ref(), "readings/alice/r1").as_deref() == Some("migrated")
    })
    .await;

    store
        .put(
            "readings/bob/r1",
            &json!({"lat": 13.0, "lng": 77.6, "patchyFlag": true}),
        )
        .expect("new record");
    wait_for("new record to migrate", || {
        status(store.as_ref(), "readings/bob/r1").as_deref() == Some("migrated")
    })
    .await;

    assert_eq!(aggregates.location_count().expect("count"), 2);
    handle.shutdown();
}
