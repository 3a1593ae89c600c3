//! Transaction creation and activation, connection closes and shutdown.

use tracing::{debug, info, warn};

use super::connection::TransactionRecord;
use super::scheduler::Entry;
use super::UniqueDatabase;
use crate::client::ClientEvent;
use crate::error::{DbError, Result};
use crate::types::{ConnectionId, ObjectStoreId, Scope, TransactionId, TransactionInfo, TransactionMode};

impl UniqueDatabase {
    /// Creates a read-only or read-write transaction on `connection` and
    /// queues it for scheduling.
    ///
    /// The transaction starts once no in-progress transaction conflicts with
    /// its scope; the owning client then receives
    /// [`ClientEvent::TransactionStarted`].
    pub fn create_transaction(
        &mut self,
        connection: ConnectionId,
        scope: impl IntoIterator<Item = ObjectStoreId>,
        mode: TransactionMode,
    ) -> Result<TransactionId> {
        let created = self.register_transaction(connection, scope.into_iter().collect(), mode);
        self.pump();
        created
    }

    fn register_transaction(
        &mut self,
        connection: ConnectionId,
        mut scope: Scope,
        mode: TransactionMode,
    ) -> Result<TransactionId> {
        let usable = self.open_connections.contains(&connection)
            && self
                .connections
                .get(&connection)
                .is_some_and(|record| !record.close_pending);
        if !usable {
            return Err(DbError::invalid_state(format!(
                "{connection} is closed or closing"
            )));
        }
        if mode == TransactionMode::VersionChange {
            return Err(DbError::invalid_state(
                "version change transactions are only created by open requests",
            ));
        }

        scope.sort_unstable();
        scope.dedup();
        if scope.is_empty() {
            return Err(DbError::unknown("transaction scope is empty"));
        }
        let schema = self.info.as_ref();
        if let Some(missing) = scope
            .iter()
            .find(|store| schema.and_then(|info| info.object_store(**store)).is_none())
        {
            return Err(DbError::unknown(format!("{missing} does not exist")));
        }

        let txn = self.next_transaction_id(connection)?;
        let info = TransactionInfo::ordinary(txn, mode, scope.clone());
        self.transactions
            .insert(txn, TransactionRecord::new(info, connection));
        if let Some(record) = self.connections.get_mut(&connection) {
            record.transactions.insert(txn);
        }
        debug!(connection = %connection, txn = %txn, ?mode, scope = ?scope, "transaction queued");
        self.scheduler.enqueue(Entry {
            id: txn,
            mode,
            scope,
            owner: connection,
        });
        Ok(txn)
    }

    pub(crate) fn handle_transactions(&mut self) {
        let Some(store) = self.backing_store.as_ref() else {
            return;
        };
        let simultaneous = store.supports_simultaneous_read_write_transactions();
        let pass = self.scheduler.schedule(simultaneous);
        if pass.deferred > 0 {
            self.metrics.transaction_deferred(pass.deferred);
        }
        for txn in pass.activated {
            self.activate_in_backing_store(txn);
        }
    }

    fn activate_in_backing_store(&mut self, txn: TransactionId) {
        let Some(record) = self.transactions.get(&txn) else {
            return;
        };
        let info = record.info.clone();
        let connection = record.connection;

        let result = self.with_backing_store(|store| store.begin_transaction(&info));
        self.metrics.transaction_started();
        match &result {
            Ok(()) => debug!(database = %self.identifier, txn = %txn, mode = ?info.mode, "transaction started"),
            Err(error) => warn!(database = %self.identifier, txn = %txn, %error, "transaction failed to begin"),
        }
        if let Some(record) = self.connections.get(&connection) {
            record.client.send(ClientEvent::TransactionStarted {
                transaction: txn,
                error: result.err(),
            });
        }
    }

    /// The client closed `connection`. Its queued transactions are released,
    /// its running ones aborted without replies, and any request waiting on
    /// it moves on.
    pub fn connection_closed_by_client(&mut self, connection: ConnectionId) {
        if !self.connections.contains_key(&connection) {
            debug!(connection = %connection, "close of unknown connection");
            return;
        }
        info!(database = %self.identifier, connection = %connection, "connection closed by client");
        self.close_connection(connection, None);
        self.pump();
    }

    /// Closes `connection` from the server side; the client receives
    /// [`ClientEvent::ClosedByServer`].
    pub fn connection_closed_by_server(&mut self, connection: ConnectionId) {
        if !self.connections.contains_key(&connection) {
            return;
        }
        info!(database = %self.identifier, connection = %connection, "connection closed by server");
        self.close_connection(
            connection,
            Some(DbError::invalid_state("connection closed by server")),
        );
        self.pump();
    }

    pub(crate) fn close_connection(&mut self, connection: ConnectionId, server_error: Option<DbError>) {
        if let Some(error) = server_error {
            if let Some(record) = self.connections.get(&connection) {
                record
                    .client
                    .send(ClientEvent::ClosedByServer { connection, error });
            }
        }
        self.open_connections.remove(&connection);
        if self.version_change_connection == Some(connection) {
            self.version_change_connection = None;
        }
        self.clear_transactions_on_connection(connection);
        self.notify_current_request_connection_closed_or_fired(connection);
        self.forget_connection(connection);
    }

    pub(crate) fn clear_transactions_on_connection(&mut self, connection: ConnectionId) {
        for txn in self.scheduler.remove_pending_of(connection) {
            self.release_record(txn);
            debug!(connection = %connection, txn = %txn, "pending transaction released");
        }
        for txn in self.scheduler.in_progress_of(connection) {
            self.abort_without_callback(txn);
        }
    }

    /// Aborts an in-progress transaction nobody waits on.
    pub(crate) fn abort_without_callback(&mut self, txn: TransactionId) {
        if let Some(Err(error)) = self.abort_running(txn) {
            warn!(database = %self.identifier, txn = %txn, %error, "abort failed");
        }
    }

    /// Aborts `txn` if it is in progress. A version change also puts back
    /// the schema it started from.
    pub(crate) fn abort_running(&mut self, txn: TransactionId) -> Option<Result<()>> {
        self.scheduler.complete(txn)?;
        let (stored, snapshot) = match self.transactions.get_mut(&txn) {
            Some(record) => (record.suspension_abort.take(), record.snapshot.take()),
            None => (None, None),
        };
        if self.version_change_transaction == Some(txn) {
            if let Some(snapshot) = snapshot {
                self.info = Some(snapshot);
            }
        }
        let result = match stored {
            Some(result) => result,
            None => self.with_backing_store(|store| store.abort_transaction(txn)),
        };
        warn!(database = %self.identifier, txn = %txn, "transaction aborted");
        self.transaction_completed(txn, false);
        Some(result)
    }

    pub(crate) fn transaction_completed(&mut self, txn: TransactionId, committed: bool) {
        self.release_record(txn);
        if self.version_change_transaction == Some(txn) {
            debug!(database = %self.identifier, txn = %txn, committed, "version change finished");
            self.version_change_transaction = None;
            self.version_change_connection = None;
        }
        self.metrics.transaction_finished(committed);
    }

    /// Drops the record of a transaction that will never run again.
    fn release_record(&mut self, txn: TransactionId) {
        if let Some(record) = self.transactions.remove(&txn) {
            if let Some(connection) = self.connections.get_mut(&record.connection) {
                connection.transactions.remove(&txn);
            }
        }
    }

    pub(crate) fn forget_connection(&mut self, connection: ConnectionId) {
        if let Some(record) = self.connections.remove(&connection) {
            for txn in record.transactions {
                self.transactions.remove(&txn);
            }
        }
    }

    /// Tears everything down at once, as when the user deletes the
    /// database's data.
    ///
    /// Queued transactions are released, running ones aborted, every request
    /// fails and every connection is closed from the server side before the
    /// backing store is closed.
    pub fn immediate_close(&mut self) {
        info!(database = %self.identifier, "closing immediately");
        for txn in self.scheduler.drain_pending() {
            self.release_record(txn);
        }
        for txn in self.scheduler.in_progress_ids() {
            self.abort_without_callback(txn);
        }
        self.scheduler.reset_usage();

        let error = DbError::user_delete();
        if let Some(request) = self.current_request.take() {
            request.fail(error.clone());
        }
        let queued: Vec<_> = self.pending_requests.drain(..).collect();
        for request in queued {
            request.fail(error.clone());
        }

        let connections: Vec<_> = self.connections.keys().copied().collect();
        for connection in connections {
            self.close_connection(connection, Some(error.clone()));
        }
        self.version_change_connection = None;
        self.version_change_transaction = None;
        self.close_backing_store();
    }

    /// Closes the backing store if nothing uses it. Ephemeral stores stay
    /// open because closing them loses their data.
    pub fn try_close(&mut self) -> bool {
        if self.version_change_connection.is_some()
            || !self.connections.is_empty()
            || self.current_request.is_some()
            || !self.pending_requests.is_empty()
        {
            return false;
        }
        if self
            .backing_store
            .as_ref()
            .is_some_and(|store| store.is_ephemeral())
        {
            return false;
        }
        self.close_backing_store();
        true
    }

    fn close_backing_store(&mut self) {
        if let Some(mut store) = self.backing_store.take() {
            store.close();
            debug!(database = %self.identifier, "backing store closed");
        }
        self.info = None;
    }

    /// Aborts every in-progress transaction in the backing store, as before
    /// the process suspends. The transactions stay in progress; the client's
    /// next abort receives the stored result.
    pub fn abort_active_transactions(&mut self) {
        for txn in self.scheduler.in_progress_ids() {
            let result = self.with_backing_store(|store| store.abort_transaction(txn));
            if let Err(error) = &result {
                warn!(database = %self.identifier, txn = %txn, %error, "abort for suspension failed");
            }
            if let Some(record) = self.transactions.get_mut(&txn) {
                record.suspension_abort = Some(result);
            }
        }
    }
}
