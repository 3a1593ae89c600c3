//! One tokio task per database.
//!
//! The task owns its [`UniqueDatabase`] outright, so coordinator state is
//! never shared. Callers talk to it through a cloneable [`DatabaseHandle`]
//! whose methods send a closure over the mailbox and await the reply on a
//! oneshot channel. Quota answers wake the task through the coordinator's
//! [`SpaceInbox`](crate::quota::SpaceInbox).

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::client::ClientLink;
use crate::coordinator::{DeleteOutcome, OpenOutcome, Reply, UniqueDatabase};
use crate::error::{DbError, Result};
use crate::schema::{IndexInfo, ObjectStoreInfo};
use crate::types::{
    ConnectionId, DatabaseIdentifier, IndexId, IndexKeys, Key, KeyRange, ObjectStoreId,
    OverwriteMode, RequestId, TransactionId, TransactionMode, Value,
};

type Job = Box<dyn FnOnce(&mut UniqueDatabase) + Send>;

enum Command {
    Run(Job),
    Shutdown(oneshot::Sender<()>),
}

/// Starts a worker task for `database` on the current tokio runtime.
pub fn spawn(database: UniqueDatabase) -> DatabaseHandle {
    let (mailbox, commands) = mpsc::unbounded_channel();
    let identifier = database.identifier().clone();
    tokio::spawn(run(database, commands));
    DatabaseHandle {
        identifier,
        mailbox,
    }
}

async fn run(mut database: UniqueDatabase, mut commands: mpsc::UnboundedReceiver<Command>) {
    let inbox = database.space_inbox();
    debug!(database = %database.identifier(), "database worker started");
    let done = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Run(job)) => job(&mut database),
                Some(Command::Shutdown(done)) => break Some(done),
                None => break None,
            },
            _ = inbox.notified() => database.process_space_decisions(),
        }
    };
    database.immediate_close();
    info!(database = %database.identifier(), "database worker stopped");
    if let Some(done) = done {
        let _ = done.send(());
    }
}

fn stopped() -> DbError {
    DbError::invalid_state("database worker has shut down")
}

/// Async front end of a database worker.
///
/// A reply the coordinator drops on purpose (commit or abort on a closed
/// connection) surfaces here as `InvalidState`.
#[derive(Clone)]
pub struct DatabaseHandle {
    identifier: DatabaseIdentifier,
    mailbox: mpsc::UnboundedSender<Command>,
}

impl DatabaseHandle {
    /// Database served by the worker.
    pub fn identifier(&self) -> &DatabaseIdentifier {
        &self.identifier
    }

    /// Whether the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    async fn call<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut UniqueDatabase, Reply<T>) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let reply: Reply<T> = Box::new(move |result| {
            let _ = tx.send(result);
        });
        self.mailbox
            .send(Command::Run(Box::new(move |db| op(db, reply))))
            .map_err(|_| stopped())?;
        rx.await
            .map_err(|_| DbError::invalid_state("operation finished without a reply"))?
    }

    async fn query<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut UniqueDatabase) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Command::Run(Box::new(move |db| {
                let _ = tx.send(op(db));
            })))
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Opens the database; resolves once the open (or its upgrade) starts.
    pub async fn open(
        &self,
        client: ClientLink,
        request: RequestId,
        requested_version: Option<u64>,
    ) -> Result<OpenOutcome> {
        self.call(move |db, reply| db.submit_open(client, request, requested_version, reply))
            .await
    }

    /// Deletes the database once every connection has closed.
    pub async fn delete(&self, client: ClientLink, request: RequestId) -> Result<DeleteOutcome> {
        self.call(move |db, reply| db.submit_delete(client, request, reply))
            .await
    }

    /// Withdraws an open or delete request.
    pub async fn cancel_request(&self, request: RequestId) -> Result<()> {
        self.query(move |db| db.cancel_request(request)).await
    }

    /// Acknowledges a version-change event.
    pub async fn did_fire_version_change_event(
        &self,
        connection: ConnectionId,
        request: RequestId,
        closed_on_behalf_of_server: bool,
    ) -> Result<()> {
        self.query(move |db| {
            db.did_fire_version_change_event(connection, request, closed_on_behalf_of_server)
        })
        .await
    }

    /// Marks a connection as closing.
    pub async fn mark_close_pending(&self, connection: ConnectionId) -> Result<()> {
        self.query(move |db| db.mark_close_pending(connection)).await
    }

    /// Closes a connection on behalf of its client.
    pub async fn close_connection(&self, connection: ConnectionId) -> Result<()> {
        self.query(move |db| db.connection_closed_by_client(connection))
            .await
    }

    /// Closes a connection from the server side.
    pub async fn close_connection_from_server(&self, connection: ConnectionId) -> Result<()> {
        self.query(move |db| db.connection_closed_by_server(connection))
            .await
    }

    /// Creates and queues a transaction.
    pub async fn create_transaction(
        &self,
        connection: ConnectionId,
        scope: Vec<ObjectStoreId>,
        mode: TransactionMode,
    ) -> Result<TransactionId> {
        self.query(move |db| db.create_transaction(connection, scope, mode))
            .await?
    }

    /// See [`UniqueDatabase::create_object_store`].
    pub async fn create_object_store(&self, txn: TransactionId, info: ObjectStoreInfo) -> Result<()> {
        self.call(move |db, reply| db.create_object_store(txn, info, reply))
            .await
    }

    /// See [`UniqueDatabase::delete_object_store`].
    pub async fn delete_object_store(&self, txn: TransactionId, name: String) -> Result<()> {
        self.call(move |db, reply| db.delete_object_store(txn, name, reply))
            .await
    }

    /// See [`UniqueDatabase::rename_object_store`].
    pub async fn rename_object_store(
        &self,
        txn: TransactionId,
        store: ObjectStoreId,
        name: String,
    ) -> Result<()> {
        self.call(move |db, reply| db.rename_object_store(txn, store, name, reply))
            .await
    }

    /// See [`UniqueDatabase::clear_object_store`].
    pub async fn clear_object_store(&self, txn: TransactionId, store: ObjectStoreId) -> Result<()> {
        self.call(move |db, reply| db.clear_object_store(txn, store, reply))
            .await
    }

    /// See [`UniqueDatabase::create_index`].
    pub async fn create_index(&self, txn: TransactionId, info: IndexInfo) -> Result<()> {
        self.call(move |db, reply| db.create_index(txn, info, reply))
            .await
    }

    /// See [`UniqueDatabase::delete_index`].
    pub async fn delete_index(
        &self,
        txn: TransactionId,
        store: ObjectStoreId,
        name: String,
    ) -> Result<()> {
        self.call(move |db, reply| db.delete_index(txn, store, name, reply))
            .await
    }

    /// See [`UniqueDatabase::rename_index`].
    pub async fn rename_index(
        &self,
        txn: TransactionId,
        store: ObjectStoreId,
        index: IndexId,
        name: String,
    ) -> Result<()> {
        self.call(move |db, reply| db.rename_index(txn, store, index, name, reply))
            .await
    }

    /// See [`UniqueDatabase::put_or_add`].
    pub async fn put_or_add(
        &self,
        txn: TransactionId,
        store: ObjectStoreId,
        key: Key,
        value: Value,
        index_keys: IndexKeys,
        mode: OverwriteMode,
    ) -> Result<Key> {
        self.call(move |db, reply| {
            db.put_or_add(txn, store, key, value, index_keys, mode, reply)
        })
        .await
    }

    /// See [`UniqueDatabase::delete_record`].
    pub async fn delete_record(
        &self,
        txn: TransactionId,
        store: ObjectStoreId,
        range: KeyRange,
    ) -> Result<()> {
        self.call(move |db, reply| db.delete_record(txn, store, range, reply))
            .await
    }

    /// See [`UniqueDatabase::get_record`].
    pub async fn get_record(
        &self,
        txn: TransactionId,
        store: ObjectStoreId,
        range: KeyRange,
    ) -> Result<Option<(Key, Value)>> {
        self.call(move |db, reply| db.get_record(txn, store, range, reply))
            .await
    }

    /// See [`UniqueDatabase::get_count`].
    pub async fn get_count(
        &self,
        txn: TransactionId,
        store: ObjectStoreId,
        range: KeyRange,
    ) -> Result<u64> {
        self.call(move |db, reply| db.get_count(txn, store, range, reply))
            .await
    }

    /// See [`UniqueDatabase::commit_transaction`].
    pub async fn commit(&self, txn: TransactionId, handled_results: usize) -> Result<()> {
        self.call(move |db, reply| db.commit_transaction(txn, handled_results, reply))
            .await
    }

    /// See [`UniqueDatabase::abort_transaction`].
    pub async fn abort(&self, txn: TransactionId) -> Result<()> {
        self.call(move |db, reply| db.abort_transaction(txn, reply))
            .await
    }

    /// Committed name and version.
    pub async fn name_and_version(&self) -> Result<Option<(String, u64)>> {
        self.query(|db| db.name_and_version()).await
    }

    /// Aborts every running transaction ahead of a suspension.
    pub async fn abort_active_transactions(&self) -> Result<()> {
        self.query(|db| db.abort_active_transactions()).await
    }

    /// Fails everything and closes the backing store.
    pub async fn immediate_close(&self) -> Result<()> {
        self.query(|db| db.immediate_close()).await
    }

    /// Closes the backing store if nothing uses it.
    pub async fn try_close(&self) -> Result<bool> {
        self.query(|db| db.try_close()).await
    }

    /// Stops the worker after closing everything it owns.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Command::Shutdown(tx))
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }
}
