//! Integration tests for EventQueue ordering, lookup and long-poll behavior.

use std::collections::BTreeMap;
use std::time::Duration;

use factline_events::{Event, EventQueue, MutationSet};
use serde_json::json;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

async fn test_queue() -> EventQueue {
    let queue = EventQueue::new(memory_pool().await);
    queue.setup().await.unwrap();
    queue
}

#[tokio::test]
async fn versions_are_gap_free_from_one() {
    let queue = test_queue().await;

    for i in 1..=5 {
        let event = queue.add("tick", json!({ "n": i }), None).await.unwrap();
        assert_eq!(event.v, i);
    }

    assert_eq!(queue.latest_version().await.unwrap(), 5);
}

#[tokio::test]
async fn empty_queue_reports_version_zero() {
    let queue = test_queue().await;
    assert_eq!(queue.latest_version().await.unwrap(), 0);
    assert!(queue.get(1).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_adds_never_duplicate_versions() {
    let queue = test_queue().await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let q = queue.clone();
        handles.push(tokio::spawn(async move {
            q.add("tick", json!({ "n": i }), None).await.unwrap().v
        }));
    }

    let mut versions = Vec::new();
    for h in handles {
        versions.push(h.await.unwrap());
    }
    versions.sort_unstable();
    assert_eq!(versions, (1..=20).collect::<Vec<i64>>());
}

#[tokio::test]
async fn get_returns_the_stored_event() {
    let queue = test_queue().await;

    let added = queue
        .add("signup", json!({ "name": "ada" }), None)
        .await
        .unwrap();
    let fetched = queue.get(added.v).await.unwrap().unwrap();

    assert_eq!(fetched, added);
    assert!(fetched.result.is_none());
    assert!(!fetched.is_err());
}

#[tokio::test]
async fn get_next_without_wait_returns_none_when_drained() {
    let queue = test_queue().await;
    queue.add("a", json!(null), None).await.unwrap();

    let next = queue.get_next(0, false).await.unwrap().unwrap();
    assert_eq!(next.v, 1);
    assert!(queue.get_next(1, false).await.unwrap().is_none());
}

#[tokio::test]
async fn get_next_long_poll_sees_a_later_append() {
    let queue = test_queue().await;

    let waiter = {
        let q = queue.clone();
        tokio::spawn(async move { q.get_next(0, true).await.unwrap() })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.add("late", json!(null), None).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.v, 1);
    assert_eq!(event.event_type, "late");
}

#[tokio::test]
async fn cancel_releases_long_poll_with_none() {
    let queue = test_queue().await;

    let waiter = {
        let q = queue.clone();
        tokio::spawn(async move { q.get_next(0, true).await.unwrap() })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn set_rewrites_outcome_and_rewritten_payload() {
    let queue = test_queue().await;

    let mut event = queue.add("doc:save", json!({ "title": "x" }), None).await.unwrap();

    // Simulate the engine finalizing the event with a result and a
    // preprocessor-assigned id in the payload.
    event.data = json!({ "title": "x", "id": 1 });
    let mut result = BTreeMap::new();
    result.insert(
        "doc".to_string(),
        MutationSet::Ins(vec![json!({ "id": 1, "title": "x" })]),
    );
    event.result = Some(result);
    queue.set(&event).await.unwrap();

    let stored: Event = queue.get(event.v).await.unwrap().unwrap();
    assert_eq!(stored, event);
    assert_eq!(stored.data["id"], json!(1));
    assert!(matches!(
        stored.result_for("doc"),
        Some(MutationSet::Ins(docs)) if docs.len() == 1
    ));
}

#[tokio::test]
async fn errored_outcome_round_trips() {
    let queue = test_queue().await;

    let mut event = queue.add("doc:insert", json!({ "id": 7 }), None).await.unwrap();
    let mut error = BTreeMap::new();
    error.insert("doc".to_string(), json!("EEXIST"));
    event.error = Some(error);
    queue.set(&event).await.unwrap();

    let stored = queue.get(event.v).await.unwrap().unwrap();
    assert!(stored.is_err());
    assert_eq!(stored.error.unwrap()["doc"], json!("EEXIST"));
}
