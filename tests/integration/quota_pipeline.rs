#![allow(missing_docs)]

use std::sync::Arc;

use idb_coordinator::{
    ClientEvent, ClientId, ClientLink, ConnectionId, CounterMetrics, DatabaseIdentifier, DbError,
    DeferredQuota, IndexKeys, Key, KeyRange, MemoryBackingStoreFactory, MemoryOptions,
    ObjectStoreId, ObjectStoreInfo, OpenOutcome, OriginQuota, OverwriteMode, QuotaArbiter, Reply,
    RequestId, Result, TransactionId, TransactionMode, UniqueDatabase, Value,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

const ORIGIN: &str = "https://quota.test";
const RECORDS: ObjectStoreId = ObjectStoreId(1);

type Slot<T> = Arc<Mutex<Option<Result<T>>>>;

fn reply<T: Send + 'static>() -> (Slot<T>, Reply<T>) {
    let slot: Slot<T> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    (slot, Box::new(move |result| *sink.lock() = Some(result)))
}

fn take<T>(slot: &Slot<T>) -> Result<T> {
    slot.lock().take().expect("reply delivered")
}

fn identifier() -> DatabaseIdentifier {
    DatabaseIdentifier::new("notes", ORIGIN)
}

/// Answers parked space requests one at a time until none are left.
fn settle(db: &mut UniqueDatabase, quota: &DeferredQuota) {
    while quota.resolve_next(true) {
        db.process_space_decisions();
    }
}

struct Fixture {
    db: UniqueDatabase,
    factory: MemoryBackingStoreFactory,
    metrics: Arc<CounterMetrics>,
    connection: ConnectionId,
    _events: UnboundedReceiver<ClientEvent>,
}

impl Fixture {
    /// Coordinator with a `records` auto-increment store at version one.
    /// `settle` runs after every step when the arbiter is deferred.
    fn new(quota: Arc<dyn QuotaArbiter>, deferred: Option<&DeferredQuota>) -> Self {
        let factory = MemoryBackingStoreFactory::new(MemoryOptions::default());
        let metrics = CounterMetrics::shared();
        let mut db = UniqueDatabase::new(identifier(), Arc::new(factory.clone()), quota)
            .with_metrics(metrics.clone());
        let (client, events) = ClientLink::new(ClientId(1));
        let step = |db: &mut UniqueDatabase| {
            if let Some(deferred) = deferred {
                settle(db, deferred);
            }
        };

        let (opened, done) = reply();
        db.submit_open(client, RequestId(1), Some(1), done);
        step(&mut db);
        let Ok(OpenOutcome::UpgradeNeeded {
            connection,
            transaction,
            ..
        }) = take(&opened)
        else {
            panic!("expected an upgrade");
        };

        let (created, done) = reply();
        db.create_object_store(
            transaction,
            ObjectStoreInfo::new(RECORDS, "records", None, true),
            done,
        );
        step(&mut db);
        take(&created).expect("create records");

        let (committed, done) = reply();
        db.commit_transaction(transaction, 1, done);
        step(&mut db);
        take(&committed).expect("commit upgrade");

        Self {
            db,
            factory,
            metrics,
            connection,
            _events: events,
        }
    }

    fn read_write(&mut self) -> TransactionId {
        self.db
            .create_transaction(self.connection, [RECORDS], TransactionMode::ReadWrite)
            .expect("create transaction")
    }

    fn put(&mut self, txn: TransactionId, payload: usize) -> Slot<Key> {
        let (put, done) = reply();
        self.db.put_or_add(
            txn,
            RECORDS,
            Key::Invalid,
            Value::from_bytes(vec![7u8; payload]),
            IndexKeys::new(),
            OverwriteMode::Add,
            done,
        );
        put
    }

    fn records(&self) -> usize {
        self.factory.record_count(&identifier(), RECORDS)
    }
}

#[test]
fn origin_budget_denies_writes_that_do_not_fit() {
    let quota = Arc::new(OriginQuota::new(100));
    let mut fx = Fixture::new(quota.clone(), None);
    // Opening the store costs 4 bytes and creating `records` 15.
    assert_eq!(quota.usage(ORIGIN), 19);

    let txn = fx.read_write();
    let denied = take(&fx.put(txn, 200));
    assert!(matches!(denied, Err(DbError::QuotaExceeded(_))), "got {denied:?}");

    // The denied put handed its generated key back.
    let stored = take(&fx.put(txn, 10));
    assert_eq!(stored, Ok(Key::Number(1.0)));

    let (committed, done) = reply();
    fx.db.commit_transaction(txn, 2, done);
    assert_eq!(take(&committed), Ok(()));

    assert_eq!(fx.records(), 1);
    assert_eq!(quota.usage(ORIGIN), 19 + 22);
    assert_eq!(fx.metrics.snapshot().quota_denials, 1);
}

#[test]
fn parked_operations_resume_in_answer_order() {
    let quota = DeferredQuota::new();
    let mut fx = Fixture::new(Arc::new(quota.clone()), Some(&quota));

    let txn = fx.read_write();
    let put = fx.put(txn, 16);
    let (counted, done) = reply();
    fx.db.get_count(txn, RECORDS, KeyRange::all(), done);

    let costs = quota.pending_costs();
    assert_eq!(costs.len(), 2);
    assert!(costs[0] > 0);
    assert_eq!(costs[1], 0);
    assert_eq!(fx.db.awaiting_space(), 2);
    assert!(put.lock().is_none());
    assert!(counted.lock().is_none());

    assert!(quota.resolve_next(true));
    fx.db.process_space_decisions();
    assert_eq!(take(&put), Ok(Key::Number(1.0)));
    assert!(counted.lock().is_none());

    assert!(quota.resolve_next(true));
    fx.db.process_space_decisions();
    assert_eq!(take(&counted), Ok(1));
    assert_eq!(fx.db.awaiting_space(), 0);
}

#[test]
fn denied_key_is_reused_after_a_later_put_keeps_its_own() {
    let quota = DeferredQuota::new();
    let mut fx = Fixture::new(Arc::new(quota.clone()), Some(&quota));

    let txn = fx.read_write();
    let first = fx.put(txn, 8);
    let second = fx.put(txn, 8);
    assert_eq!(quota.pending(), 2);

    assert!(quota.resolve_next(false));
    assert!(quota.resolve_next(true));
    fx.db.process_space_decisions();
    let denied = take(&first);
    assert!(matches!(denied, Err(DbError::QuotaExceeded(_))), "got {denied:?}");
    assert_eq!(take(&second), Ok(Key::Number(2.0)));

    let third = fx.put(txn, 8);
    settle(&mut fx.db, &quota);
    assert_eq!(take(&third), Ok(Key::Number(1.0)));

    let fourth = fx.put(txn, 8);
    settle(&mut fx.db, &quota);
    assert_eq!(take(&fourth), Ok(Key::Number(3.0)));
    assert_eq!(fx.records(), 3);
}

#[test]
fn denied_rename_keeps_the_old_name() {
    let quota = DeferredQuota::new();
    let mut fx = Fixture::new(Arc::new(quota.clone()), Some(&quota));
    fx.db.connection_closed_by_client(fx.connection);

    let (client, _events) = ClientLink::new(ClientId(2));
    let (opened, done) = reply();
    fx.db.submit_open(client, RequestId(2), Some(2), done);
    settle(&mut fx.db, &quota);
    let Ok(OpenOutcome::UpgradeNeeded { transaction, .. }) = take(&opened) else {
        panic!("expected an upgrade");
    };

    fx.factory.clear_journal();
    let (renamed, done) = reply();
    fx.db
        .rename_object_store(transaction, RECORDS, "archive".into(), done);
    assert_eq!(quota.pending(), 1);
    assert!(quota.resolve_next(false));
    fx.db.process_space_decisions();

    let result = take(&renamed);
    assert!(matches!(result, Err(DbError::QuotaExceeded(_))), "got {result:?}");
    assert!(fx.factory.journal_ops().is_empty());
    let info = fx.db.info().expect("schema loaded");
    assert_eq!(
        info.object_store(RECORDS).map(|store| store.name.as_str()),
        Some("records")
    );
}

#[test]
fn answers_for_closed_connections_fail_without_writing() {
    let quota = DeferredQuota::new();
    let mut fx = Fixture::new(Arc::new(quota.clone()), Some(&quota));

    let txn = fx.read_write();
    let put = fx.put(txn, 32);
    assert_eq!(quota.pending(), 1);

    fx.db.connection_closed_by_client(fx.connection);
    assert!(fx.db.in_progress_transactions().is_empty());

    settle(&mut fx.db, &quota);
    let result = take(&put);
    assert!(matches!(result, Err(DbError::InvalidState(_))), "got {result:?}");
    assert_eq!(fx.records(), 0);
    assert!(!fx.factory.journal_ops().contains(&"add_record"));
}
