#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use idb_coordinator::{
    worker, ClientEvent, ClientId, ClientLink, DatabaseHandle, DatabaseIdentifier,
    DatabaseManager, DbError, DeferredQuota, IndexKeys, Key, KeyRange, MemoryBackingStoreFactory,
    MemoryOptions, ObjectStoreId, ObjectStoreInfo, OpenOutcome, OverwriteMode, QuotaArbiter,
    RequestId, TransactionId, TransactionMode, UniqueDatabase, UnlimitedQuota, Value,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const STORE: ObjectStoreId = ObjectStoreId(1);
const PATIENCE: Duration = Duration::from_secs(5);

fn spawn_worker(quota: Arc<dyn QuotaArbiter>) -> DatabaseHandle {
    let factory = MemoryBackingStoreFactory::new(MemoryOptions::default());
    worker::spawn(UniqueDatabase::new(
        DatabaseIdentifier::new("inbox", "https://mail.test"),
        Arc::new(factory),
        quota,
    ))
}

async fn next_event(events: &mut UnboundedReceiver<ClientEvent>) -> ClientEvent {
    timeout(PATIENCE, events.recv())
        .await
        .expect("event within timeout")
        .expect("event channel open")
}

async fn wait_started(events: &mut UnboundedReceiver<ClientEvent>, txn: TransactionId) {
    loop {
        if let ClientEvent::TransactionStarted { transaction, error } = next_event(events).await {
            if transaction == txn {
                assert_eq!(error, None);
                return;
            }
        }
    }
}

/// Opens version one with a `messages` store and returns the connection.
async fn prepare(handle: &DatabaseHandle, client: ClientLink) -> OpenOutcome {
    let outcome = handle
        .open(client, RequestId(1), Some(1))
        .await
        .expect("open");
    let OpenOutcome::UpgradeNeeded { transaction, .. } = outcome else {
        panic!("expected an upgrade, got {outcome:?}");
    };
    handle
        .create_object_store(
            transaction,
            ObjectStoreInfo::new(STORE, "messages", None, true),
        )
        .await
        .expect("create store");
    handle.commit(transaction, 1).await.expect("commit upgrade");
    outcome
}

#[tokio::test]
async fn handle_runs_a_read_write_transaction() {
    let handle = spawn_worker(Arc::new(UnlimitedQuota));
    let (client, mut events) = ClientLink::new(ClientId(1));
    let connection = prepare(&handle, client).await.connection();
    assert_eq!(
        handle.name_and_version().await.expect("name and version"),
        Some(("inbox".to_string(), 1))
    );

    let txn = handle
        .create_transaction(connection, vec![STORE], TransactionMode::ReadWrite)
        .await
        .expect("create transaction");
    wait_started(&mut events, txn).await;

    let key = handle
        .put_or_add(
            txn,
            STORE,
            Key::Invalid,
            Value::from_bytes(b"hello".to_vec()),
            IndexKeys::new(),
            OverwriteMode::Add,
        )
        .await
        .expect("put");
    assert_eq!(key, Key::Number(1.0));

    let record = handle
        .get_record(txn, STORE, KeyRange::only(key.clone()))
        .await
        .expect("get record");
    assert_eq!(record, Some((key, Value::from_bytes(b"hello".to_vec()))));
    assert_eq!(handle.get_count(txn, STORE, KeyRange::all()).await, Ok(1));
    assert_eq!(handle.commit(txn, 3).await, Ok(()));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn quota_answers_wake_the_worker() {
    let quota = DeferredQuota::new();
    let handle = spawn_worker(Arc::new(quota.clone()));
    let (client, _events) = ClientLink::new(ClientId(1));

    let opening = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open(client, RequestId(1), None).await }
    });
    timeout(PATIENCE, async {
        while quota.pending() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("open parked on the arbiter");

    assert!(quota.resolve_next(true));
    let outcome = timeout(PATIENCE, opening)
        .await
        .expect("open finishes")
        .expect("task joins")
        .expect("open succeeds");
    assert!(
        matches!(outcome, OpenOutcome::UpgradeNeeded { old_version: 0, .. }),
        "got {outcome:?}"
    );
}

#[tokio::test]
async fn completions_for_a_closed_connection_surface_as_invalid_state() {
    let handle = spawn_worker(Arc::new(UnlimitedQuota));
    let (client, mut events) = ClientLink::new(ClientId(1));
    let connection = prepare(&handle, client).await.connection();

    let txn = handle
        .create_transaction(connection, vec![STORE], TransactionMode::ReadOnly)
        .await
        .expect("create transaction");
    wait_started(&mut events, txn).await;
    handle
        .close_connection(connection)
        .await
        .expect("close connection");

    let late = handle.commit(txn, 0).await;
    assert!(matches!(late, Err(DbError::InvalidState(_))), "got {late:?}");
}

#[tokio::test]
async fn shutdown_fails_waiting_requests_and_closes_connections() {
    let handle = spawn_worker(Arc::new(UnlimitedQuota));
    let (owner, mut owner_events) = ClientLink::new(ClientId(1));
    let connection = prepare(&handle, owner).await.connection();

    let (upgrader, _upgrader_events) = ClientLink::new(ClientId(2));
    let upgrading = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open(upgrader, RequestId(2), Some(2)).await }
    });
    loop {
        if let ClientEvent::VersionChange { request, .. } = next_event(&mut owner_events).await {
            assert_eq!(request, RequestId(2));
            break;
        }
    }

    handle.shutdown().await.expect("shutdown");

    let result = timeout(PATIENCE, upgrading)
        .await
        .expect("upgrade request finishes")
        .expect("task joins");
    assert!(matches!(result, Err(DbError::Unknown(_))), "got {result:?}");
    loop {
        if let ClientEvent::ClosedByServer {
            connection: closed,
            error,
        } = next_event(&mut owner_events).await
        {
            assert_eq!(closed, connection);
            assert!(matches!(error, DbError::Unknown(_)));
            break;
        }
    }
    assert!(handle.name_and_version().await.is_err());
}

#[tokio::test]
async fn manager_keeps_one_worker_per_database() {
    let factory = MemoryBackingStoreFactory::new(MemoryOptions::default());
    let manager = DatabaseManager::new(Arc::new(factory), Arc::new(UnlimitedQuota));
    let inbox = DatabaseIdentifier::new("inbox", "https://mail.test");
    let outbox = DatabaseIdentifier::new("outbox", "https://mail.test");

    let first = manager.database(&inbox);
    let (client, _events) = ClientLink::new(ClientId(1));
    prepare(&first, client).await;

    // A second lookup reaches the same coordinator and sees its schema.
    let again = manager.database(&inbox);
    assert_eq!(
        again.name_and_version().await.expect("name and version"),
        Some(("inbox".to_string(), 1))
    );
    manager.database(&outbox);
    assert_eq!(manager.databases(), vec![inbox, outbox]);

    manager.shutdown().await;
    assert!(manager.databases().is_empty());
    assert!(first.name_and_version().await.is_err());
}
