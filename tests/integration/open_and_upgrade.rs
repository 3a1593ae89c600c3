#![allow(missing_docs)]

use std::sync::Arc;

use idb_coordinator::{
    ClientEvent, ClientId, ClientLink, ConnectionId, DatabaseIdentifier, DbError, DeleteOutcome,
    IndexId, IndexInfo, KeyPath, MemoryBackingStoreFactory, MemoryOptions, ObjectStoreId,
    ObjectStoreInfo, OpenOutcome, Reply, RequestId, Result, UniqueDatabase, UnlimitedQuota,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

type Slot<T> = Arc<Mutex<Option<Result<T>>>>;

fn reply<T: Send + 'static>() -> (Slot<T>, Reply<T>) {
    let slot: Slot<T> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    (slot, Box::new(move |result| *sink.lock() = Some(result)))
}

fn take<T>(slot: &Slot<T>) -> Result<T> {
    slot.lock().take().expect("reply delivered")
}

fn events(receiver: &mut UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut out = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        out.push(event);
    }
    out
}

fn library(factory: &MemoryBackingStoreFactory) -> UniqueDatabase {
    UniqueDatabase::new(
        DatabaseIdentifier::new("library", "https://books.test"),
        Arc::new(factory.clone()),
        Arc::new(UnlimitedQuota),
    )
}

fn open(
    db: &mut UniqueDatabase,
    client: &ClientLink,
    request: u64,
    version: Option<u64>,
) -> Slot<OpenOutcome> {
    let (slot, done) = reply();
    db.submit_open(client.clone(), RequestId(request), version, done);
    slot
}

/// Runs an upgrade to `version` that creates `stores`, and returns the
/// upgrading connection.
fn upgrade(
    db: &mut UniqueDatabase,
    client: &ClientLink,
    request: u64,
    version: u64,
    stores: &[ObjectStoreInfo],
) -> ConnectionId {
    let opened = open(db, client, request, Some(version));
    let Ok(OpenOutcome::UpgradeNeeded {
        connection,
        transaction,
        ..
    }) = take(&opened)
    else {
        panic!("expected an upgrade to version {version}");
    };
    for info in stores {
        let (created, done) = reply();
        db.create_object_store(transaction, info.clone(), done);
        take(&created).expect("create object store");
    }
    let (committed, done) = reply();
    db.commit_transaction(transaction, stores.len(), done);
    take(&committed).expect("commit upgrade");
    connection
}

fn books() -> ObjectStoreInfo {
    ObjectStoreInfo::new(
        ObjectStoreId(1),
        "books",
        Some(KeyPath::Single("isbn".into())),
        false,
    )
}

#[test]
fn schema_created_in_an_upgrade_is_visible_to_later_opens() {
    let factory = MemoryBackingStoreFactory::new(MemoryOptions::default());
    let mut db = library(&factory);
    let (writer, _writer_events) = ClientLink::new(ClientId(1));

    let opened = open(&mut db, &writer, 1, Some(1));
    let Ok(OpenOutcome::UpgradeNeeded {
        transaction,
        old_version,
        ..
    }) = take(&opened)
    else {
        panic!("expected an upgrade");
    };
    assert_eq!(old_version, 0);
    assert_eq!(db.name_and_version(), None);

    let (created, done) = reply();
    db.create_object_store(transaction, books(), done);
    take(&created).expect("create books");
    let (indexed, done) = reply();
    db.create_index(
        transaction,
        IndexInfo {
            id: IndexId(1),
            object_store: ObjectStoreId(1),
            name: "by_author".into(),
            key_path: KeyPath::Single("author".into()),
            unique: false,
            multi_entry: false,
        },
        done,
    );
    take(&indexed).expect("create index");
    let (committed, done) = reply();
    db.commit_transaction(transaction, 2, done);
    take(&committed).expect("commit");

    assert_eq!(db.name_and_version(), Some(("library".to_string(), 1)));
    assert_eq!(db.version_change_transaction(), None);

    let (reader, _reader_events) = ClientLink::new(ClientId(2));
    let reopened = take(&open(&mut db, &reader, 2, None)).expect("open");
    let OpenOutcome::Opened { info, .. } = reopened else {
        panic!("expected a plain open, got {reopened:?}");
    };
    assert_eq!(info.version, 1);
    let store = info.object_store_named("books").expect("books store");
    assert!(store.index_named("by_author").is_some());
}

#[test]
fn upgrade_is_blocked_until_the_old_connection_closes() {
    let factory = MemoryBackingStoreFactory::new(MemoryOptions::default());
    let mut db = library(&factory);
    let (old_client, mut old_events) = ClientLink::new(ClientId(1));
    let (new_client, mut new_events) = ClientLink::new(ClientId(2));

    let old = upgrade(&mut db, &old_client, 1, 1, &[books()]);
    events(&mut old_events);

    let pending = open(&mut db, &new_client, 2, Some(2));
    assert!(pending.lock().is_none());
    assert_eq!(
        events(&mut old_events),
        vec![ClientEvent::VersionChange {
            connection: old,
            request: RequestId(2),
            old_version: 1,
            new_version: Some(2),
        }]
    );

    db.did_fire_version_change_event(old, RequestId(2), false);
    assert_eq!(
        events(&mut new_events),
        vec![ClientEvent::Blocked {
            request: RequestId(2),
            old_version: 1,
            new_version: Some(2),
        }]
    );
    assert!(pending.lock().is_none());

    db.connection_closed_by_client(old);
    let outcome = take(&pending).expect("upgrade starts");
    let OpenOutcome::UpgradeNeeded {
        transaction,
        old_version,
        ref info,
        ..
    } = outcome
    else {
        panic!("expected an upgrade, got {outcome:?}");
    };
    assert_eq!(old_version, 1);
    assert_eq!(info.version, 2);
    assert_eq!(db.name_and_version(), Some(("library".to_string(), 1)));

    let (aborted, done) = reply();
    db.abort_transaction(transaction, done);
    take(&aborted).expect("abort upgrade");
    assert_eq!(db.info().map(|info| info.version), Some(1));
    assert!(db.info().is_some_and(|info| info.object_store_named("books").is_some()));
}

#[test]
fn opening_below_the_stored_version_fails() {
    let factory = MemoryBackingStoreFactory::new(MemoryOptions::default());
    let mut db = library(&factory);
    let (client, _events) = ClientLink::new(ClientId(1));

    let connection = upgrade(&mut db, &client, 1, 3, &[]);
    db.connection_closed_by_client(connection);

    let result = take(&open(&mut db, &client, 2, Some(2)));
    assert!(matches!(result, Err(DbError::Version(_))), "got {result:?}");
    assert!(db.open_connections().is_empty());
}

#[test]
fn delete_waits_for_connections_and_reports_the_old_version() {
    let factory = MemoryBackingStoreFactory::new(MemoryOptions::default());
    let mut db = library(&factory);
    let (owner, mut owner_events) = ClientLink::new(ClientId(1));
    let (deleter, _deleter_events) = ClientLink::new(ClientId(2));

    let connection = upgrade(&mut db, &owner, 1, 3, &[books()]);
    events(&mut owner_events);

    let (deleted, done) = reply();
    db.submit_delete(deleter.clone(), RequestId(2), done);
    assert!(deleted.lock().is_none());
    assert!(events(&mut owner_events).contains(&ClientEvent::VersionChange {
        connection,
        request: RequestId(2),
        old_version: 3,
        new_version: None,
    }));

    db.connection_closed_by_client(connection);
    assert_eq!(take(&deleted), Ok(DeleteOutcome { deleted_version: 3 }));
    assert!(factory.journal_ops().contains(&"delete_backing_store"));
    assert_eq!(db.name_and_version(), None);

    // The name is free again: a fresh open starts from version zero.
    let reopened = take(&open(&mut db, &owner, 3, None)).expect("open");
    let OpenOutcome::UpgradeNeeded { old_version, .. } = reopened else {
        panic!("expected an upgrade, got {reopened:?}");
    };
    assert_eq!(old_version, 0);
}

#[test]
fn cancelling_a_blocked_upgrade_lets_the_next_open_through() {
    let factory = MemoryBackingStoreFactory::new(MemoryOptions::default());
    let mut db = library(&factory);
    let (first, _first_events) = ClientLink::new(ClientId(1));
    let (upgrader, _upgrader_events) = ClientLink::new(ClientId(2));
    let (late, _late_events) = ClientLink::new(ClientId(3));

    upgrade(&mut db, &first, 1, 1, &[books()]);
    let blocked = open(&mut db, &upgrader, 2, Some(2));
    let queued = open(&mut db, &late, 3, None);
    assert_eq!(db.current_request(), Some(RequestId(2)));
    assert_eq!(db.queued_requests(), vec![RequestId(3)]);

    db.cancel_request(RequestId(2));

    assert!(blocked.lock().is_none());
    let outcome = take(&queued).expect("queued open");
    assert!(matches!(outcome, OpenOutcome::Opened { .. }), "got {outcome:?}");
    assert_eq!(outcome.info().version, 1);
    assert_eq!(db.open_connections().len(), 2);
}
