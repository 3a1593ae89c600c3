//! Open/delete admission and version-change exclusivity.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::connection::{ConnectionRecord, OpenRequest, RequestKind, TransactionRecord};
use super::{DeleteOutcome, Deferred, OpenOutcome, Reply, UniqueDatabase};
use crate::backing::{BackingStore, BackingStoreFactory};
use crate::client::{ClientEvent, ClientLink};
use crate::error::{DbError, Result};
use crate::metrics::CoordinatorMetrics;
use crate::schema::DatabaseInfo;
use crate::types::{ConnectionId, DatabaseIdentifier, RequestId, TransactionInfo};

impl UniqueDatabase {
    /// Queues an open request.
    ///
    /// `requested_version` of `None` (or 0) opens the stored version, or
    /// version 1 for a new database.
    pub fn submit_open(
        &mut self,
        client: ClientLink,
        request: RequestId,
        requested_version: Option<u64>,
        reply: Reply<OpenOutcome>,
    ) {
        debug!(database = %self.identifier, request_id = %request, ?requested_version, "open request queued");
        self.pending_requests.push_back(OpenRequest::new(
            request,
            client,
            RequestKind::Open {
                requested_version,
                reply,
            },
        ));
        self.pump();
    }

    /// Queues a delete request.
    pub fn submit_delete(
        &mut self,
        client: ClientLink,
        request: RequestId,
        reply: Reply<DeleteOutcome>,
    ) {
        debug!(database = %self.identifier, request_id = %request, "delete request queued");
        self.pending_requests
            .push_back(OpenRequest::new(request, client, RequestKind::Delete { reply }));
        self.pump();
    }

    /// Withdraws a request. A current request frees its slot immediately and
    /// the next queued request is admitted; a request that owns the pending
    /// version-change connection closes that connection.
    pub fn cancel_request(&mut self, request: RequestId) {
        debug!(database = %self.identifier, request_id = %request, "request cancelled");
        if self.current_request() == Some(request) {
            self.current_request = None;
        }
        self.close_version_change_connection_of(request);

        if let Some(index) = self.pending_requests.iter().position(|r| r.id == request) {
            self.pending_requests.remove(index);
        }
        self.pump();
    }

    /// Acknowledges a version-change event delivered to `connection`.
    ///
    /// When `closed_on_behalf_of_server` is set the connection is treated as
    /// closed: its transactions are released or aborted first.
    pub fn did_fire_version_change_event(
        &mut self,
        connection: ConnectionId,
        request: RequestId,
        closed_on_behalf_of_server: bool,
    ) {
        if self.current_request() != Some(request) {
            debug!(connection = %connection, request_id = %request, "stale version change acknowledgement");
            return;
        }
        if closed_on_behalf_of_server && self.open_connections.contains(&connection) {
            self.clear_transactions_on_connection(connection);
            self.open_connections.remove(&connection);
        }
        self.notify_current_request_connection_closed_or_fired(connection);
        self.pump();
    }

    /// Marks a connection as closing. It receives no further version-change
    /// events and no longer holds up version changes once it has
    /// acknowledged.
    pub fn mark_close_pending(&mut self, connection: ConnectionId) {
        if let Some(record) = self.connections.get_mut(&connection) {
            record.close_pending = true;
        }
        self.pump();
    }

    /// Committed name and version, ignoring an upgrade in flight. `None`
    /// until the database has a committed version.
    pub fn name_and_version(&self) -> Option<(String, u64)> {
        let info = self.info.as_ref()?;
        let version = self
            .version_change_transaction
            .and_then(|txn| self.transactions.get(&txn))
            .and_then(|record| record.snapshot.as_ref())
            .map_or(info.version, |snapshot| snapshot.version);
        (version > 0).then(|| (info.name.clone(), version))
    }

    pub(crate) fn handle_database_operations(&mut self) {
        if self.current_request.is_none()
            && (self.version_change_connection.is_some()
                || self.version_change_transaction.is_some())
        {
            return;
        }

        if self
            .current_request
            .as_ref()
            .map_or(true, |request| request.client.is_closed())
        {
            if let Some(stale) = self.current_request.take() {
                debug!(request_id = %stale.id, "dropping request of closed client");
                self.close_version_change_connection_of(stale.id);
            }
            self.current_request = self.take_next_runnable_request();
        }

        while self.current_request.is_some() {
            self.handle_current_operation();
            if self.version_change_transaction.is_some() || self.current_request.is_some() {
                break;
            }
            self.current_request = self.take_next_runnable_request();
        }
    }

    /// Closes the connection a blocked upgrade created for `request`, if
    /// there is one.
    fn close_version_change_connection_of(&mut self, request: RequestId) {
        let Some(connection) = self.version_change_connection else {
            return;
        };
        let owned = self
            .connections
            .get(&connection)
            .is_some_and(|record| record.open_request == request);
        if owned {
            debug!(request_id = %request, connection = %connection, "closing pending version change connection");
            self.close_connection(connection, None);
        }
    }

    fn take_next_runnable_request(&mut self) -> Option<OpenRequest> {
        while self
            .pending_requests
            .front()
            .is_some_and(|request| request.client.is_closed())
        {
            if let Some(stale) = self.pending_requests.pop_front() {
                debug!(request_id = %stale.id, "discarding request of closed client");
            }
        }
        let request = self.pending_requests.pop_front()?;
        self.metrics.request_admitted();
        debug!(
            database = %self.identifier,
            request_id = %request.id,
            open = request.is_open(),
            "request admitted"
        );
        Some(request)
    }

    fn handle_current_operation(&mut self) {
        match self.current_request.as_ref().map(OpenRequest::is_open) {
            Some(true) => self.perform_current_open(),
            Some(false) => self.perform_current_delete(),
            None => {}
        }
    }

    fn perform_current_open(&mut self) {
        if self.backing_store.is_some() {
            return self.open_after_space_check(true);
        }
        if self.quota.is_none() {
            return self.open_after_space_check(false);
        }
        let Some(request) = self.current_request() else {
            return;
        };
        if !self.open_space_checks.insert(request) {
            return;
        }
        let cost = self.cost.open_backing_store();
        self.request_space(cost, Deferred::OpenBackingStore { request });
    }

    pub(crate) fn open_after_space_check(&mut self, granted: bool) {
        if self.backing_store.is_none() {
            let opened = match (&self.factory, granted) {
                (None, _) => Err(DbError::invalid_state("database manager is unavailable")),
                (Some(_), false) => Err(DbError::quota_exceeded("open backing store")),
                (Some(factory), true) => establish(factory.as_ref(), &self.identifier),
            };
            match opened {
                Ok((store, info)) => {
                    self.backing_store = Some(store);
                    self.info = Some(info);
                    self.most_recent_deleted_info = None;
                }
                Err(error) => return self.fail_current_request(error),
            }
        }

        // An earlier upgrade may have been waiting on open connections.
        if self.version_change_connection.is_some() {
            if self.version_change_transaction.is_none() && self.open_connections.is_empty() {
                self.start_version_change_transaction();
            }
            return;
        }

        let current = self.current_version();
        let Some(request) = self.current_request.as_ref() else {
            return;
        };
        let Some(requested) = request.target_version(current) else {
            return;
        };
        if requested < current {
            return self.fail_current_request(DbError::Version(format!(
                "requested version {requested} is lower than stored version {current}"
            )));
        }

        let client = request.client.clone();
        let open_request = request.id;
        let connection = self.next_connection_id();
        self.connections
            .insert(connection, ConnectionRecord::new(client, open_request));

        if requested == current {
            self.open_connections.insert(connection);
            let info = self
                .info
                .clone()
                .unwrap_or_else(|| DatabaseInfo::new(self.identifier.name.clone(), current));
            info!(database = %self.identifier, request_id = %open_request, connection = %connection, version = current, "database opened");
            self.resolve_current_open(OpenOutcome::Opened { connection, info });
            return;
        }

        self.version_change_connection = Some(connection);
        if self.open_connections.is_empty() {
            self.start_version_change_transaction();
        } else {
            self.maybe_notify_connections_of_version_change();
        }
    }

    fn perform_current_delete(&mut self) {
        if !self.open_connections.is_empty() {
            self.maybe_notify_connections_of_version_change();
            return;
        }
        // Only the first of several queued deletes touches storage.
        if self.info.is_none() && self.most_recent_deleted_info.is_some() {
            self.did_delete_backing_store(0);
        } else {
            self.delete_backing_store();
        }
    }

    fn delete_backing_store(&mut self) {
        let store = match self.backing_store.take() {
            Some(store) => Ok(store),
            None => match &self.factory {
                Some(factory) => factory.create_backing_store(&self.identifier),
                None => Err(DbError::invalid_state("database manager is unavailable")),
            },
        };
        let mut store = match store {
            Ok(store) => store,
            Err(error) => return self.fail_current_request(error),
        };
        let version = store.database_version();
        if let Err(error) = store.delete_backing_store() {
            warn!(database = %self.identifier, %error, "failed to delete backing store");
        }
        self.did_delete_backing_store(version);
    }

    fn did_delete_backing_store(&mut self, deleted_version: u64) {
        if let Some(info) = self.info.take() {
            self.most_recent_deleted_info = Some(info);
        }
        let name = self.identifier.name.clone();
        let deleted_version = self
            .most_recent_deleted_info
            .get_or_insert_with(|| DatabaseInfo::new(name, deleted_version))
            .version;

        let Some(request) = self.current_request.take() else {
            return;
        };
        info!(database = %self.identifier, request_id = %request.id, deleted_version, "database deleted");
        match request.kind {
            RequestKind::Delete { reply } => reply(Ok(DeleteOutcome { deleted_version })),
            RequestKind::Open { reply, .. } => {
                reply(Err(DbError::unknown("open request resolved as a delete")))
            }
        }
    }

    fn start_version_change_transaction(&mut self) {
        let Some(connection) = self.version_change_connection else {
            return;
        };
        let Some(request) = self.current_request.take() else {
            return;
        };
        let old_version = self.current_version();
        let new_version = request.target_version(old_version).unwrap_or(old_version);
        let reply = match request.kind {
            RequestKind::Open { reply, .. } => reply,
            RequestKind::Delete { reply } => {
                return reply(Err(DbError::unknown(
                    "delete request cannot start a version change",
                )))
            }
        };

        let txn = match self.next_transaction_id(connection) {
            Ok(txn) => txn,
            Err(error) => {
                self.version_change_connection = None;
                self.forget_connection(connection);
                return reply(Err(error));
            }
        };
        let info = TransactionInfo::version_change(txn, new_version);
        let mut record = TransactionRecord::new(info.clone(), connection);
        record.snapshot = self.info.clone();
        self.transactions.insert(txn, record);
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.transactions.insert(txn);
        }
        self.version_change_transaction = Some(txn);
        self.scheduler.admit_version_change(txn, connection);

        match self.with_backing_store(|store| store.begin_transaction(&info)) {
            Ok(()) => {
                self.open_connections.insert(connection);
                let name = self.identifier.name.clone();
                let schema = self.info.get_or_insert_with(|| DatabaseInfo::new(name, 0));
                schema.version = new_version;
                let schema = schema.clone();
                self.metrics.transaction_started();
                info!(
                    database = %self.identifier,
                    request_id = %request.id,
                    txn = %txn,
                    old_version,
                    new_version,
                    "version change started"
                );
                reply(Ok(OpenOutcome::UpgradeNeeded {
                    connection,
                    transaction: txn,
                    old_version,
                    info: schema,
                }));
            }
            Err(error) => {
                warn!(database = %self.identifier, txn = %txn, %error, "version change failed to begin");
                self.abort_without_callback(txn);
                self.version_change_connection = None;
                self.forget_connection(connection);
                reply(Err(error));
            }
        }
    }

    fn maybe_notify_connections_of_version_change(&mut self) {
        let old_version = self.current_version();
        let Some(request) = self.current_request.as_mut() else {
            return;
        };
        if request.awaiting.is_some() {
            return;
        }

        let new_version = request.target_version(old_version);
        let mut notified = BTreeSet::new();
        for id in &self.open_connections {
            let Some(connection) = self.connections.get(id) else {
                continue;
            };
            if connection.close_pending {
                continue;
            }
            connection.client.send(ClientEvent::VersionChange {
                connection: *id,
                request: request.id,
                old_version,
                new_version,
            });
            notified.insert(*id);
        }

        debug!(request_id = %request.id, notified = notified.len(), ?new_version, "version change events sent");
        if notified.is_empty() {
            notify_request_blocked(request, old_version, self.metrics.as_ref());
        } else {
            request.awaiting = Some(notified);
        }
    }

    pub(crate) fn notify_current_request_connection_closed_or_fired(
        &mut self,
        connection: ConnectionId,
    ) {
        let Some(request) = self.current_request.as_mut() else {
            return;
        };
        if let Some(awaiting) = request.awaiting.as_mut() {
            awaiting.remove(&connection);
        }
        if request.has_connections_pending_version_change() {
            return;
        }

        if self.open_connections.is_empty() || self.all_connections_closed_or_closing() {
            self.handle_database_operations();
            return;
        }

        // Every connection saw the event but some are still open.
        let old_version = self.current_version();
        if let Some(request) = self.current_request.as_mut() {
            notify_request_blocked(request, old_version, self.metrics.as_ref());
        }
    }

    fn all_connections_closed_or_closing(&self) -> bool {
        self.open_connections.iter().all(|id| {
            self.connections
                .get(id)
                .map_or(true, |record| record.close_pending)
        })
    }

    pub(crate) fn fail_current_request(&mut self, error: DbError) {
        if let Some(request) = self.current_request.take() {
            warn!(database = %self.identifier, request_id = %request.id, %error, "request failed");
            request.fail(error);
        }
    }

    fn resolve_current_open(&mut self, outcome: OpenOutcome) {
        let Some(request) = self.current_request.take() else {
            return;
        };
        match request.kind {
            RequestKind::Open { reply, .. } => reply(Ok(outcome)),
            RequestKind::Delete { reply } => {
                reply(Err(DbError::unknown("delete request resolved as an open")))
            }
        }
    }
}

fn notify_request_blocked(request: &mut OpenRequest, old_version: u64, metrics: &dyn CoordinatorMetrics) {
    if request.blocked_sent {
        return;
    }
    request.blocked_sent = true;
    let new_version = request.target_version(old_version);
    request.client.send(ClientEvent::Blocked {
        request: request.id,
        old_version,
        new_version,
    });
    metrics.request_blocked();
    debug!(request_id = %request.id, old_version, ?new_version, "request blocked");
}

fn establish(
    factory: &dyn BackingStoreFactory,
    identifier: &DatabaseIdentifier,
) -> Result<(Box<dyn BackingStore>, DatabaseInfo)> {
    let mut store = factory.create_backing_store(identifier)?;
    match store.get_or_establish_database_info() {
        Ok(info) => Ok((store, info)),
        Err(error) => {
            warn!(database = %identifier, %error, "failed to load database info");
            Err(error)
        }
    }
}
