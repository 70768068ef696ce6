//! End-to-end tests for the keyed document model running under a live
//! engine: id assignment, the action policy, and replay-stable storage.

use std::sync::Arc;

use factline_engine::{EntityDef, EntityModel, Esdb, EsdbError, EsdbOptions, MutationSet};
use factline_model::{KeyedModel, KeyedStore};
use serde_json::json;

async fn open_docs() -> (Esdb, KeyedStore) {
    let esdb = Esdb::open(
        EsdbOptions::default(),
        vec![EntityDef::new("doc", Arc::new(KeyedModel::new("doc")))],
    )
    .await
    .unwrap();
    let store = KeyedStore::new(esdb.clone(), "doc");
    (esdb, store)
}

fn event_error(result: Result<serde_json::Value, EsdbError>) -> serde_json::Value {
    match result {
        Err(EsdbError::EventFailed(event)) => {
            serde_json::to_value(event.error.as_ref().unwrap()).unwrap()
        }
        Err(other) => panic!("expected a failed event, got {other}"),
        Ok(doc) => panic!("expected a failed event, got {doc}"),
    }
}

#[tokio::test]
async fn insert_assigns_sequential_integer_ids() {
    let (esdb, store) = open_docs().await;

    let first = store.insert(json!({ "name": "ada" })).await.unwrap();
    let second = store.insert(json!({ "name": "grace" })).await.unwrap();
    assert_eq!(first["id"], json!(1));
    assert_eq!(second["id"], json!(2));

    // The assigned id lands in the stored event, so replaying the log
    // reassigns the same ids.
    let stored = esdb.queue().get(1).await.unwrap().unwrap();
    assert_eq!(stored.data["id"], json!(1));
    assert_eq!(stored.data["action"], json!("insert"));

    esdb.close().await;
}

#[tokio::test]
async fn insert_on_a_taken_id_fails_eexist() {
    let (esdb, store) = open_docs().await;

    store.insert(json!({ "id": "k", "n": 1 })).await.unwrap();
    let error = event_error(store.insert(json!({ "id": "k", "n": 2 })).await);
    assert_eq!(error["doc"], json!("EEXIST"));

    // The stored document is untouched and the log still advanced.
    let doc = esdb
        .reader("doc")
        .unwrap()
        .get(&json!("k"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["n"], json!(1));
    assert_eq!(esdb.current_version().await.unwrap(), 2);

    esdb.close().await;
}

#[tokio::test]
async fn update_of_a_missing_document_fails_enoent() {
    let (esdb, store) = open_docs().await;

    let error = event_error(store.update(json!({ "id": "ghost", "n": 1 })).await);
    assert_eq!(error["doc"], json!("ENOENT"));
    assert_eq!(esdb.current_version().await.unwrap(), 1);

    esdb.close().await;
}

#[tokio::test]
async fn update_without_an_id_is_rejected_before_dispatch() {
    let (esdb, store) = open_docs().await;

    assert!(store.update(json!({ "n": 1 })).await.is_err());
    // Nothing was logged.
    assert_eq!(esdb.queue().latest_version().await.unwrap(), 0);

    esdb.close().await;
}

#[tokio::test]
async fn update_merges_shallowly_into_the_stored_document() {
    let (esdb, store) = open_docs().await;

    store
        .set(json!({ "id": "k", "a": 1, "b": { "x": 1 } }))
        .await
        .unwrap();
    let merged = store
        .update(json!({ "id": "k", "b": { "y": 2 } }))
        .await
        .unwrap();

    assert_eq!(merged, json!({ "id": "k", "a": 1, "b": { "y": 2 } }));
    let read_back = esdb
        .reader("doc")
        .unwrap()
        .get(&json!("k"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read_back, merged);

    esdb.close().await;
}

#[tokio::test]
async fn set_replaces_the_whole_document() {
    let (esdb, store) = open_docs().await;

    store.set(json!({ "id": "k", "a": 1, "b": 2 })).await.unwrap();
    let replaced = store.set(json!({ "id": "k", "c": 3 })).await.unwrap();

    assert_eq!(replaced, json!({ "id": "k", "c": 3 }));

    esdb.close().await;
}

#[tokio::test]
async fn save_inserts_then_merges() {
    let (esdb, store) = open_docs().await;

    let created = store.save(json!({ "id": "k", "a": 1 })).await.unwrap();
    assert_eq!(created, json!({ "id": "k", "a": 1 }));

    let merged = store.save(json!({ "id": "k", "b": 2 })).await.unwrap();
    assert_eq!(merged, json!({ "id": "k", "a": 1, "b": 2 }));

    esdb.close().await;
}

#[tokio::test]
async fn remove_deletes_and_is_a_noop_when_already_gone() {
    let (esdb, store) = open_docs().await;

    store.insert(json!({ "id": "k" })).await.unwrap();
    assert!(store.remove(json!("k")).await.unwrap());
    assert!(esdb
        .reader("doc")
        .unwrap()
        .get(&json!("k"))
        .await
        .unwrap()
        .is_none());

    // Still logged, still successful, no mutation recorded.
    assert!(store.remove(json!("k")).await.unwrap());
    let stored = esdb.queue().get(3).await.unwrap().unwrap();
    assert!(stored.result.is_none());
    assert!(stored.error.is_none());

    esdb.close().await;
}

#[tokio::test]
async fn reapplying_a_set_mutation_yields_the_same_state() {
    let model = KeyedModel::new("doc");
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let mut conn = pool.acquire().await.unwrap();
    model.setup(&mut conn).await.unwrap();

    let changes = MutationSet::Set(vec![json!({ "id": "k", "n": 1 })]);
    model.apply_changes(&mut conn, &changes).await.unwrap();
    model.apply_changes(&mut conn, &changes).await.unwrap();

    let doc = model.get(&mut conn, &json!("k")).await.unwrap().unwrap();
    assert_eq!(doc, json!({ "id": "k", "n": 1 }));
}
