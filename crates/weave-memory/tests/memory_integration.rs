#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the weave-memory crate.
//!
//! Covers file persistence round-trips, write-through saving without an
//! explicit flush, version continuity across reloads,
//! observer isolation, and concurrent writers on distinct keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use weave_core::{WeaveError, WeaveResult};
use weave_memory::{SharedStateStore, StateEntry};

// ---------------------------------------------------------------------------
// 1. Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn persistence_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("state").join("shared.json");

    let mut meta = HashMap::new();
    meta.insert("source".to_string(), json!("research"));

    {
        let store = SharedStateStore::open(&path).await.unwrap();
        store.write("plan", json!({"steps": ["a", "b"]}), "planner");
        store.write("plan", json!({"steps": ["a", "b", "c"]}), "planner");
        store.write_with_metadata("notes", json!("draft"), "writer", meta.clone());
        store.flush().await.unwrap();
    }

    let reloaded = SharedStateStore::open(&path).await.unwrap();
    assert_eq!(reloaded.keys(), vec!["notes".to_string(), "plan".to_string()]);

    let plan = reloaded.read_entry("plan").unwrap();
    assert_eq!(plan.value, json!({"steps": ["a", "b", "c"]}));
    assert_eq!(plan.version, 2);
    assert_eq!(plan.author, "planner");

    let notes = reloaded.read_entry("notes").unwrap();
    assert_eq!(notes.metadata, meta);

    // Versioning continues from the persisted value.
    assert_eq!(reloaded.write("plan", json!(null), "planner"), 3);
}

#[tokio::test]
async fn writes_survive_reopen_without_flush() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("live.json");

    {
        let store = SharedStateStore::open(&path).await.unwrap();
        store.write("status", json!("running"), "orchestrator");
        store.write("status", json!("done"), "orchestrator");
        store.write("scratch", json!([1, 2]), "worker");
        store.delete("scratch");
    }

    let reloaded = SharedStateStore::open(&path).await.unwrap();
    assert_eq!(reloaded.read("status"), Some(json!("done")));
    assert_eq!(reloaded.version("status"), 2);
    assert!(!reloaded.exists("scratch"));

    reloaded.clear();
    drop(reloaded);
    let emptied = SharedStateStore::open(&path).await.unwrap();
    assert!(emptied.is_empty());
}

#[tokio::test]
async fn open_missing_file_starts_empty() {
    let tmp = TempDir::new().unwrap();
    let store = SharedStateStore::open(tmp.path().join("fresh.json")).await.unwrap();
    assert!(store.is_empty());
    assert!(store.path().is_some());
}

#[tokio::test]
async fn open_rejects_corrupt_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("broken.json");
    tokio::fs::write(&path, "{ not json").await.unwrap();

    let err = SharedStateStore::open(&path).await.unwrap_err();
    assert!(matches!(err, WeaveError::State(_)));
}

#[tokio::test]
async fn flush_omits_deleted_keys() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("s.json");

    let store = SharedStateStore::open(&path).await.unwrap();
    store.write("keep", json!(1), "a");
    store.write("drop", json!(2), "a");
    store.delete("drop");
    store.flush().await.unwrap();

    let raw = tokio::fs::read_to_string(&path).await.unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(doc.get("keep").is_some());
    assert!(doc.get("drop").is_none());
    assert_eq!(doc["keep"]["version"], json!(1));
    assert_eq!(doc["keep"]["author"], json!("a"));
}

// ---------------------------------------------------------------------------
// 2. Observers
// ---------------------------------------------------------------------------

#[test]
fn observers_run_after_commit_and_see_new_value() {
    let store = Arc::new(SharedStateStore::new());
    let observed = Arc::new(AtomicUsize::new(0));

    let reader = store.clone();
    let counter = observed.clone();
    store.subscribe("score", move |key: &str, entry: &StateEntry| -> WeaveResult<()> {
        // The store is readable from inside the callback.
        assert_eq!(reader.read(key), Some(entry.value.clone()));
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    store.write("score", json!(10), "judge");
    store.write("score", json!(11), "judge");
    assert_eq!(observed.load(Ordering::SeqCst), 2);
}

#[test]
fn one_bad_observer_does_not_block_others() {
    let store = SharedStateStore::new();
    let good = Arc::new(AtomicUsize::new(0));

    store.subscribe("k", |_: &str, _: &StateEntry| -> WeaveResult<()> {
        Err(WeaveError::State("nope".into()))
    });
    let g = good.clone();
    store.subscribe("k", move |_: &str, _: &StateEntry| -> WeaveResult<()> {
        g.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    for i in 0..3 {
        store.write("k", json!(i), "a");
    }
    assert_eq!(good.load(Ordering::SeqCst), 3);
    assert_eq!(store.version("k"), 3);
    assert_eq!(store.statistics().notifications_failed, 3);
}

// ---------------------------------------------------------------------------
// 3. Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_on_distinct_keys() {
    let store = Arc::new(SharedStateStore::new());
    let mut handles = Vec::new();
    for w in 0..4 {
        let s = store.clone();
        handles.push(tokio::spawn(async move {
            for n in 0..100 {
                s.write(&format!("worker-{w}"), json!(n), &format!("w{w}"));
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    for w in 0..4 {
        let entry = store.read_entry(&format!("worker-{w}")).unwrap();
        assert_eq!(entry.version, 100);
        assert_eq!(entry.value, json!(99));
    }
    assert_eq!(store.statistics().writes, 400);
}
