//! Coordinator writes flowing through the store's change feed into a
//! running dispatcher.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use couchline::interfaces::Document;
use couchline::storage::MockDocumentStore;
use couchline::test_utils::{NotifyCall, RecordingNotifier};
use couchline::{
    BulkMutationCoordinator, ChangeDispatcher, Config, DispatcherState, OperationKind,
};

const WAIT: Duration = Duration::from_secs(2);

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

struct Harness {
    store: Arc<MockDocumentStore>,
    notifier: Arc<RecordingNotifier>,
    coordinator: BulkMutationCoordinator,
    dispatcher: ChangeDispatcher,
}

async fn started() -> Harness {
    let config = Config::for_test();
    let store = Arc::new(MockDocumentStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let coordinator = BulkMutationCoordinator::from_config(store.clone(), &config.store);
    let dispatcher = ChangeDispatcher::with_separator(
        store.clone(),
        notifier.clone(),
        config.dispatcher.clone(),
        config.store.separator.clone(),
    );
    dispatcher.start().await.unwrap();
    Harness {
        store,
        notifier,
        coordinator,
        dispatcher,
    }
}

#[tokio::test]
async fn test_create_update_delete_notify_observers() {
    let h = started().await;

    let created = h
        .coordinator
        .create("users", 1, doc(json!({"name": "a"})))
        .await
        .unwrap();
    assert!(h.notifier.wait_for_calls(1, WAIT).await);

    let mut model = created.into_document();
    model.insert("name".to_string(), json!("b"));
    h.coordinator.update("users", 1, model).await.unwrap();
    assert!(h.notifier.wait_for_calls(2, WAIT).await);

    h.coordinator.delete("users", 1).await.unwrap();
    assert!(h.notifier.wait_for_calls(3, WAIT).await);

    assert_eq!(
        h.notifier.calls().await,
        vec![
            NotifyCall::new("users", OperationKind::Create, &["1"]),
            NotifyCall::new("users", OperationKind::Update, &["1"]),
            NotifyCall::new("users", OperationKind::Delete, &["1"]),
        ]
    );
    h.dispatcher.close().await;
}

#[tokio::test]
async fn test_bulk_write_is_one_notification_per_table() {
    let h = started().await;

    h.coordinator
        .create_all(
            "orders",
            &[3, 1, 2],
            vec![Document::new(), Document::new(), Document::new()],
        )
        .await
        .unwrap();

    assert!(h.notifier.wait_for_calls(1, WAIT).await);
    assert_eq!(
        h.notifier.calls().await,
        vec![NotifyCall::new("orders", OperationKind::Create, &["1", "2", "3"])]
    );
    h.dispatcher.close().await;
}

#[tokio::test]
async fn test_checkpoint_follows_latest_dispatched_revision() {
    let h = started().await;

    let created = h
        .coordinator
        .create("users", 1, Document::new())
        .await
        .unwrap();
    assert!(h.notifier.wait_for_calls(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        h.dispatcher.checkpoint().await.as_deref(),
        Some(created.revision())
    );
    h.dispatcher.close().await;
}

#[tokio::test]
async fn test_partial_delete_all_notifies_only_deleted_documents() {
    let h = started().await;
    h.coordinator
        .create_all("users", &[1, 2], vec![Document::new(), Document::new()])
        .await
        .unwrap();
    assert!(h.notifier.wait_for_calls(1, WAIT).await);
    h.notifier.clear().await;

    h.store
        .inject_bulk_error("users__2", "conflict", Some("Document update conflict."))
        .await;
    let deleted = h.coordinator.delete_all("users", &[1, 2]).await.unwrap();
    assert_eq!(deleted.len(), 2);

    assert!(h.notifier.wait_for_calls(1, WAIT).await);
    assert_eq!(
        h.notifier.calls().await,
        vec![NotifyCall::new("users", OperationKind::Delete, &["1"])]
    );
    h.dispatcher.close().await;
}

#[tokio::test]
async fn test_failing_observer_does_not_stall_other_tables() {
    let h = started().await;
    h.notifier.fail_table("orders").await;

    h.coordinator
        .create("orders", 1, Document::new())
        .await
        .unwrap();
    h.coordinator
        .create("users", 1, Document::new())
        .await
        .unwrap();

    assert!(h.notifier.wait_for_calls(2, WAIT).await);
    assert_eq!(h.dispatcher.state(), DispatcherState::Active);
    h.dispatcher.close().await;
}

#[tokio::test]
async fn test_writes_before_start_are_not_replayed() {
    let config = Config::for_test();
    let store = Arc::new(MockDocumentStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let coordinator = BulkMutationCoordinator::from_config(store.clone(), &config.store);
    coordinator
        .create("users", 1, Document::new())
        .await
        .unwrap();

    let dispatcher = ChangeDispatcher::new(store.clone(), notifier.clone(), config.dispatcher);
    dispatcher.start().await.unwrap();
    coordinator
        .create("users", 2, Document::new())
        .await
        .unwrap();

    assert!(notifier.wait_for_calls(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        notifier.calls().await,
        vec![NotifyCall::new("users", OperationKind::Create, &["2"])]
    );
    dispatcher.close().await;
}
