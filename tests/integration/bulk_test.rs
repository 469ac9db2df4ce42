//! Bulk coordinator behaviour against the mock store.

use std::sync::Arc;

use serde_json::{json, Value};

use couchline::interfaces::{Document, MangoQuery};
use couchline::storage::MockDocumentStore;
use couchline::{BulkMutationCoordinator, PersistenceError, RawResponse};

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

fn coordinator() -> (Arc<MockDocumentStore>, BulkMutationCoordinator) {
    let store = Arc::new(MockDocumentStore::new());
    let coordinator = BulkMutationCoordinator::with_separator(store.clone(), "::");
    (store, coordinator)
}

#[tokio::test]
async fn test_read_all_then_update_all_round_trip() {
    let (_store, coordinator) = coordinator();
    coordinator
        .create_all(
            "users",
            &["a", "b"],
            vec![doc(json!({"age": 1})), doc(json!({"age": 2}))],
        )
        .await
        .unwrap();

    let models: Vec<Document> = coordinator
        .read_all("users", &["a", "b"])
        .await
        .unwrap()
        .into_iter()
        .map(|entity| {
            let mut model = entity.into_document();
            model.insert("age".to_string(), json!(10));
            model
        })
        .collect();
    let updated = coordinator
        .update_all("users", &["a", "b"], models)
        .await
        .unwrap();

    assert!(updated.iter().all(|u| u.revision().starts_with("2-")));
    let read = coordinator.read("users", "b").await.unwrap();
    assert_eq!(read.get("age"), Some(&json!(10)));
    assert_eq!(read.revision(), updated[1].revision());
}

#[tokio::test]
async fn test_update_all_with_stale_revisions_reports_each_item() {
    let (_store, coordinator) = coordinator();
    let created = coordinator
        .create_all("users", &[1, 2], vec![Document::new(), Document::new()])
        .await
        .unwrap();
    let stale: Vec<Document> = created.into_iter().map(|c| c.into_document()).collect();
    coordinator
        .update_all("users", &[1, 2], stale.clone())
        .await
        .unwrap();

    let err = coordinator
        .update_all("users", &[1, 2], stale)
        .await
        .unwrap_err();

    assert!(matches!(err, PersistenceError::BulkFailed(_)));
    assert_eq!(
        err.to_string(),
        "el 0: conflict - Document update conflict.\nel 1: conflict - Document update conflict."
    );
}

#[tokio::test]
async fn test_deleted_documents_are_gone_for_read_and_read_all() {
    let (store, coordinator) = coordinator();
    coordinator
        .create_all("users", &[1, 2], vec![Document::new(), Document::new()])
        .await
        .unwrap();

    coordinator.delete_all("users", &[1, 2]).await.unwrap();

    assert_eq!(store.live_count().await, 0);
    let err = coordinator.read("users", 1).await.unwrap_err();
    assert!(matches!(err, PersistenceError::NotFound(_)));

    // Tombstoned rows carry neither a document nor an error.
    let err = coordinator.read_all("users", &[1, 2]).await.unwrap_err();
    assert!(matches!(err, PersistenceError::Impossible(_)));
}

#[tokio::test]
async fn test_raw_query_with_projection() {
    let (_store, coordinator) = coordinator();
    coordinator
        .create_all(
            "users",
            &[1, 2, 3],
            vec![
                doc(json!({"name": "a", "role": "admin"})),
                doc(json!({"name": "b", "role": "user"})),
                doc(json!({"name": "c", "role": "admin"})),
            ],
        )
        .await
        .unwrap();

    let mut query = MangoQuery::new(json!({"role": "admin"}));
    query.fields = Some(vec!["name".to_string()]);
    let RawResponse::Docs(docs) = coordinator.raw(query, true).await.unwrap() else {
        panic!("expected documents only");
    };

    assert_eq!(docs, vec![doc(json!({"name": "a"})), doc(json!({"name": "c"}))]);
}
