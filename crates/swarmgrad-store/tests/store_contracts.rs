//! Contract tests for `ObjectStore` over the in-memory and local backends.
//!
//! Covers window gating at the exact boundaries, status markers, and
//! retention after N+k publishes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use swarmgrad_store::fakes::MemoryBackend;
use swarmgrad_store::{
    ArtifactKind, Backend, FetchOutcome, LocalBackend, ObjectStore, RetryPolicy, StorageKey,
    TimeWindow,
};

fn fast_retry() -> RetryPolicy {
    RetryPolicy::fixed(3, Duration::from_millis(1))
}

fn memory_store(retention: usize) -> (Arc<MemoryBackend>, ObjectStore) {
    let backend = Arc::new(MemoryBackend::new());
    let store = ObjectStore::new(backend.clone(), "3", retention).with_retry(fast_retry());
    (backend, store)
}

fn window() -> TimeWindow {
    let anchor = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
    TimeWindow::from_anchor(anchor, 30)
}

// ===========================================================================
// Window gating
// ===========================================================================

#[tokio::test]
async fn gating_accepts_time_min() {
    let (backend, store) = memory_store(10);
    let tw = window();
    backend.set_time(Some(tw.time_min));
    store.publish("17", 4821, ArtifactKind::Gradient, b"g").await.unwrap();

    let got = store.fetch("17", 4821, ArtifactKind::Gradient, Some(&tw)).await;
    assert_eq!(got, FetchOutcome::Found(b"g".to_vec()));
}

#[tokio::test]
async fn gating_accepts_time_max() {
    let (backend, store) = memory_store(10);
    let tw = window();
    backend.set_time(Some(tw.time_max));
    store.publish("17", 4821, ArtifactKind::Gradient, b"g").await.unwrap();

    let got = store.fetch("17", 4821, ArtifactKind::Gradient, Some(&tw)).await;
    assert!(got.is_found());
}

#[tokio::test]
async fn gating_rejects_one_second_late() {
    let (backend, store) = memory_store(10);
    let tw = window();
    backend.set_time(Some(tw.time_max + chrono::Duration::seconds(1)));
    store.publish("17", 4821, ArtifactKind::Gradient, b"g").await.unwrap();

    let got = store.fetch("17", 4821, ArtifactKind::Gradient, Some(&tw)).await;
    assert_eq!(got, FetchOutcome::TooLate);
}

#[tokio::test]
async fn gating_rejects_early() {
    let (backend, store) = memory_store(10);
    let tw = window();
    backend.set_time(Some(tw.time_min - chrono::Duration::seconds(1)));
    store.publish("17", 4821, ArtifactKind::Gradient, b"g").await.unwrap();

    let got = store.fetch("17", 4821, ArtifactKind::Gradient, Some(&tw)).await;
    assert_eq!(got, FetchOutcome::TooEarly);
}

#[tokio::test]
async fn gating_skipped_without_backend_timestamp() {
    let (backend, store) = memory_store(10);
    backend.hide_timestamps(true);
    store.publish("17", 1, ArtifactKind::Gradient, b"g").await.unwrap();

    let got = store.fetch("17", 1, ArtifactKind::Gradient, Some(&window())).await;
    assert!(got.is_found());
}

#[tokio::test]
async fn status_marker_surfaces_as_sentinel() {
    let (backend, store) = memory_store(10);
    let key = StorageKey::new(ArtifactKind::Gradient, 2, "17", "3");
    backend.insert_raw(&key, br#"{"__status": "TOO_LATE"}"#.to_vec(), None);

    let got = store.fetch("17", 2, ArtifactKind::Gradient, None).await;
    assert_eq!(got, FetchOutcome::TooLate);
}

#[tokio::test]
async fn missing_artifact_is_absent() {
    let (_backend, store) = memory_store(10);
    let got = store.fetch("17", 2, ArtifactKind::Gradient, Some(&window())).await;
    assert_eq!(got, FetchOutcome::Absent);
}

#[tokio::test]
async fn version_mismatch_is_absent() {
    let (backend, store) = memory_store(10);
    let key = StorageKey::new(ArtifactKind::Gradient, 2, "17", "2");
    backend.insert_raw(&key, b"old protocol".to_vec(), None);

    let got = store.fetch("17", 2, ArtifactKind::Gradient, None).await;
    assert_eq!(got, FetchOutcome::Absent);
}

// ===========================================================================
// Retention
// ===========================================================================

#[tokio::test]
async fn retention_keeps_newest_n_after_n_plus_k_publishes() {
    let (_backend, store) = memory_store(3);
    for window in 1..=7u64 {
        store
            .publish("17", window, ArtifactKind::Gradient, b"g")
            .await
            .unwrap();
    }
    store.settle().await;

    let windows = store.list_windows("17", ArtifactKind::Gradient).await.unwrap();
    assert_eq!(windows, vec![5, 6, 7]);
}

#[tokio::test]
async fn retention_is_scoped_to_role_and_kind() {
    let (_backend, store) = memory_store(1);
    for window in 1..=3u64 {
        store.publish("17", window, ArtifactKind::Gradient, b"g").await.unwrap();
        store.publish("17", window, ArtifactKind::Debug, b"d").await.unwrap();
        store.publish("18", window, ArtifactKind::Gradient, b"g").await.unwrap();
    }
    store.settle().await;

    assert_eq!(store.list_windows("17", ArtifactKind::Gradient).await.unwrap(), vec![3]);
    assert_eq!(store.list_windows("17", ArtifactKind::Debug).await.unwrap(), vec![3]);
    assert_eq!(store.list_windows("18", ArtifactKind::Gradient).await.unwrap(), vec![3]);
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    let (backend, store) = memory_store(100);
    for window in 1..=5u64 {
        store.publish("17", window, ArtifactKind::Debug, b"d").await.unwrap();
    }
    store.settle().await;

    let first = store.cleanup("17", ArtifactKind::Debug, 2).await.unwrap();
    assert_eq!(first.removed_count, 3);
    assert_eq!(first.remaining_count, 2);
    assert_eq!(
        first.removed_keys,
        vec!["debug-1-17-v3", "debug-2-17-v3", "debug-3-17-v3"]
    );

    let second = store.cleanup("17", ArtifactKind::Debug, 2).await.unwrap();
    assert_eq!(second.removed_count, 0);
    assert_eq!(backend.len(), 2);
}

// ===========================================================================
// Local backend through the store
// ===========================================================================

#[tokio::test]
async fn local_store_retention_and_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()).unwrap());
    let store = ObjectStore::new(backend, "3", 2).with_retry(fast_retry());

    for window in 10..15u64 {
        store
            .publish("5", window, ArtifactKind::Checkpoint, format!("state {window}").as_bytes())
            .await
            .unwrap();
    }
    store.settle().await;

    assert_eq!(
        store.list_windows("5", ArtifactKind::Checkpoint).await.unwrap(),
        vec![13, 14]
    );
    assert_eq!(
        store.fetch("5", 14, ArtifactKind::Checkpoint, None).await,
        FetchOutcome::Found(b"state 14".to_vec())
    );
    assert_eq!(
        store.fetch("5", 10, ArtifactKind::Checkpoint, None).await,
        FetchOutcome::Absent
    );
    assert!(!dir.path().join("5").join("10").exists());
}
