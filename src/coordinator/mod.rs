//! Single-database transaction coordinator.
//!
//! A [`UniqueDatabase`] serializes every open, delete and transaction against
//! one `(name, origin)` database. It is a plain state machine: methods take
//! `&mut self`, never block, and report results through one-shot [`Reply`]
//! callbacks. Work that needs the quota arbiter parks under a
//! [`SpaceTicket`](crate::quota::SpaceTicket) and resumes when the answer is
//! applied by [`UniqueDatabase::process_space_decisions`].
//!
//! The coordinator is split by concern:
//! - `requests`: open/delete admission and version-change exclusivity
//! - `scheduler`: scope-conflict scheduling of ordinary transactions
//! - `mutations`: quota-gated schema and record operations, commit and abort
//! - `lifecycle`: transaction creation, connection closes and shutdown

mod connection;
mod lifecycle;
mod mutations;
mod requests;
mod scheduler;


use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::backing::{BackingStore, BackingStoreFactory};
use crate::error::{DbError, Result};
use crate::metrics::{CoordinatorMetrics, NoopMetrics};
use crate::quota::{
    CostModel, DefaultCostModel, QuotaArbiter, SpaceCheck, SpaceDecision, SpaceInbox, SpaceReply,
    SpaceTicket,
};
use crate::schema::{DatabaseInfo, IndexInfo, ObjectStoreInfo};
use crate::types::{
    ConnectionId, DatabaseIdentifier, IndexId, IndexKeys, Key, KeyRange, ObjectStoreId,
    OverwriteMode, RequestId, TransactionId, Value,
};

use connection::{ConnectionRecord, OpenRequest, TransactionRecord};
use scheduler::Scheduler;

/// One-shot completion callback for a coordinator operation.
pub type Reply<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Successful result of an open request.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    /// The database was already at the requested version.
    Opened {
        /// New connection.
        connection: ConnectionId,
        /// Schema at open time.
        info: DatabaseInfo,
    },
    /// A version-change transaction is running on the new connection.
    UpgradeNeeded {
        /// New connection owning the version change.
        connection: ConnectionId,
        /// Version-change transaction.
        transaction: TransactionId,
        /// Version before the upgrade.
        old_version: u64,
        /// Schema with the new version applied.
        info: DatabaseInfo,
    },
}

impl OpenOutcome {
    /// Connection created by the open.
    pub fn connection(&self) -> ConnectionId {
        match self {
            OpenOutcome::Opened { connection, .. }
            | OpenOutcome::UpgradeNeeded { connection, .. } => *connection,
        }
    }

    /// Schema delivered with the open.
    pub fn info(&self) -> &DatabaseInfo {
        match self {
            OpenOutcome::Opened { info, .. } | OpenOutcome::UpgradeNeeded { info, .. } => info,
        }
    }
}

/// Successful result of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Version the database had before it was deleted.
    pub deleted_version: u64,
}

/// Operation on a transaction awaiting its result.
pub(crate) struct Call<T> {
    pub(crate) txn: TransactionId,
    /// Position of the operation among the transaction's requests.
    pub(crate) slot: usize,
    pub(crate) reply: Reply<T>,
}

pub(crate) struct PendingPut {
    pub(crate) call: Call<Key>,
    pub(crate) store: ObjectStoreInfo,
    pub(crate) key: Key,
    pub(crate) value: Value,
    pub(crate) index_keys: IndexKeys,
    pub(crate) mode: OverwriteMode,
    /// Key number reserved from the generator, reverted on failure.
    pub(crate) generated: Option<u64>,
}

/// Operation parked on a space request, with everything needed to resume it.
pub(crate) enum Deferred {
    OpenBackingStore {
        request: RequestId,
    },
    CreateObjectStore {
        call: Call<()>,
        info: ObjectStoreInfo,
    },
    DeleteObjectStore {
        call: Call<()>,
        name: String,
    },
    RenameObjectStore {
        call: Call<()>,
        store: ObjectStoreId,
        name: String,
    },
    ClearObjectStore {
        call: Call<()>,
        store: ObjectStoreId,
    },
    CreateIndex {
        call: Call<()>,
        info: IndexInfo,
    },
    DeleteIndex {
        call: Call<()>,
        store: ObjectStoreId,
        name: String,
    },
    RenameIndex {
        call: Call<()>,
        store: ObjectStoreId,
        index: IndexId,
        name: String,
    },
    PutOrAdd(Box<PendingPut>),
    DeleteRecord {
        call: Call<()>,
        store: ObjectStoreId,
        range: KeyRange,
    },
    GetRecord {
        call: Call<Option<(Key, Value)>>,
        store: ObjectStoreId,
        range: KeyRange,
    },
    GetCount {
        call: Call<u64>,
        store: ObjectStoreId,
        range: KeyRange,
    },
    Commit {
        txn: TransactionId,
        handled_results: usize,
        reply: Reply<()>,
    },
    Abort {
        txn: TransactionId,
        reply: Reply<()>,
    },
}

impl Deferred {
    fn transaction(&self) -> Option<TransactionId> {
        match self {
            Deferred::OpenBackingStore { .. } => None,
            Deferred::CreateObjectStore { call, .. }
            | Deferred::DeleteObjectStore { call, .. }
            | Deferred::RenameObjectStore { call, .. }
            | Deferred::ClearObjectStore { call, .. }
            | Deferred::CreateIndex { call, .. }
            | Deferred::DeleteIndex { call, .. }
            | Deferred::RenameIndex { call, .. }
            | Deferred::DeleteRecord { call, .. } => Some(call.txn),
            Deferred::PutOrAdd(put) => Some(put.call.txn),
            Deferred::GetRecord { call, .. } => Some(call.txn),
            Deferred::GetCount { call, .. } => Some(call.txn),
            Deferred::Commit { txn, .. } | Deferred::Abort { txn, .. } => Some(*txn),
        }
    }
}

/// What an id without a live transaction record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retired {
    /// Committed or aborted; its connection is still open.
    Finished,
    /// Its connection has closed.
    ConnectionGone,
    /// Not handed out by this coordinator.
    NeverIssued,
}

/// Coordinator for one database.
///
/// Requests are admitted one at a time; ordinary transactions are scheduled
/// by scope; a version change runs alone.
pub struct UniqueDatabase {
    identifier: DatabaseIdentifier,
    factory: Option<Arc<dyn BackingStoreFactory>>,
    quota: Option<Arc<dyn QuotaArbiter>>,
    cost: Arc<dyn CostModel>,
    metrics: Arc<dyn CoordinatorMetrics>,

    inbox: Arc<SpaceInbox>,
    next_ticket: u64,
    pending_space: FxHashMap<SpaceTicket, Deferred>,
    open_space_checks: FxHashSet<RequestId>,

    backing_store: Option<Box<dyn BackingStore>>,
    info: Option<DatabaseInfo>,
    most_recent_deleted_info: Option<DatabaseInfo>,

    pending_requests: VecDeque<OpenRequest>,
    current_request: Option<OpenRequest>,

    next_connection: u64,
    connections: BTreeMap<ConnectionId, ConnectionRecord>,
    open_connections: BTreeSet<ConnectionId>,
    version_change_connection: Option<ConnectionId>,
    version_change_transaction: Option<TransactionId>,

    transactions: FxHashMap<TransactionId, TransactionRecord>,
    scheduler: Scheduler,
}

impl UniqueDatabase {
    /// Coordinator for `identifier` that creates its backing store through
    /// `factory` and asks `quota` before growing the database.
    pub fn new(
        identifier: DatabaseIdentifier,
        factory: Arc<dyn BackingStoreFactory>,
        quota: Arc<dyn QuotaArbiter>,
    ) -> Self {
        Self {
            identifier,
            factory: Some(factory),
            quota: Some(quota),
            cost: Arc::new(DefaultCostModel::default()),
            metrics: Arc::new(NoopMetrics),
            inbox: Arc::new(SpaceInbox::new()),
            next_ticket: 1,
            pending_space: FxHashMap::default(),
            open_space_checks: FxHashSet::default(),
            backing_store: None,
            info: None,
            most_recent_deleted_info: None,
            pending_requests: VecDeque::new(),
            current_request: None,
            next_connection: 1,
            connections: BTreeMap::new(),
            open_connections: BTreeSet::new(),
            version_change_connection: None,
            version_change_transaction: None,
            transactions: FxHashMap::default(),
            scheduler: Scheduler::default(),
        }
    }

    /// Replaces the byte-cost model.
    pub fn with_cost_model(mut self, cost: Arc<dyn CostModel>) -> Self {
        self.cost = cost;
        self
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn CoordinatorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Drops the factory and arbiter. Later operations that need them fail
    /// with `InvalidState`.
    pub fn detach_manager(&mut self) {
        debug!(database = %self.identifier, "manager detached");
        self.factory = None;
        self.quota = None;
    }

    /// Database this coordinator serves.
    pub fn identifier(&self) -> &DatabaseIdentifier {
        &self.identifier
    }

    /// Current in-memory schema, if the database has been loaded.
    pub fn info(&self) -> Option<&DatabaseInfo> {
        self.info.as_ref()
    }

    /// Inbox the quota arbiter posts answers to.
    pub fn space_inbox(&self) -> Arc<SpaceInbox> {
        Arc::clone(&self.inbox)
    }

    /// Number of operations waiting for a space answer.
    pub fn awaiting_space(&self) -> usize {
        self.pending_space.len()
    }

    /// Request currently being processed.
    pub fn current_request(&self) -> Option<RequestId> {
        self.current_request.as_ref().map(|request| request.id)
    }

    /// Requests queued behind the current one.
    pub fn queued_requests(&self) -> Vec<RequestId> {
        self.pending_requests.iter().map(|r| r.id).collect()
    }

    /// Open connections, sorted by id.
    pub fn open_connections(&self) -> Vec<ConnectionId> {
        self.open_connections.iter().copied().collect()
    }

    /// In-progress transactions, sorted by id.
    pub fn in_progress_transactions(&self) -> Vec<TransactionId> {
        self.scheduler.in_progress_ids()
    }

    /// Queued transactions in scheduling order.
    pub fn pending_transactions(&self) -> Vec<TransactionId> {
        self.scheduler.pending_ids()
    }

    /// Running version-change transaction.
    pub fn version_change_transaction(&self) -> Option<TransactionId> {
        self.version_change_transaction
    }

    /// Whether a backing store is open.
    pub fn has_backing_store(&self) -> bool {
        self.backing_store.is_some()
    }

    /// Applies every quota answer posted so far and runs whatever they
    /// unblocked.
    pub fn process_space_decisions(&mut self) {
        self.pump();
    }

    /// Re-runs request admission and transaction scheduling until no quota
    /// answers are left to apply.
    pub(crate) fn pump(&mut self) {
        loop {
            self.handle_database_operations();
            self.handle_transactions();
            let decisions = self.inbox.drain();
            if decisions.is_empty() {
                break;
            }
            for decision in decisions {
                self.apply_space_decision(decision);
            }
        }
    }

    fn apply_space_decision(&mut self, decision: SpaceDecision) {
        let Some(deferred) = self.pending_space.remove(&decision.ticket) else {
            trace!(ticket = decision.ticket.0, "space answer for unknown ticket");
            return;
        };
        self.resume(deferred, SpaceCheck::from_granted(decision.granted));
    }

    /// Parks `deferred` and asks the arbiter for `cost` bytes.
    pub(crate) fn request_space(&mut self, cost: u64, deferred: Deferred) {
        let Some(quota) = self.quota.clone() else {
            self.fail_deferred(deferred, DbError::invalid_state("quota manager is unavailable"));
            return;
        };
        let ticket = SpaceTicket(self.next_ticket);
        self.next_ticket += 1;
        trace!(database = %self.identifier, ticket = ticket.0, cost, "requesting space");
        self.pending_space.insert(ticket, deferred);
        quota.request_space(
            &self.identifier.origin,
            cost,
            SpaceReply::new(ticket, Arc::clone(&self.inbox)),
        );
    }

    fn resume(&mut self, deferred: Deferred, check: SpaceCheck) {
        if check == SpaceCheck::Fail {
            self.metrics.quota_denied();
        }
        if let Deferred::OpenBackingStore { request } = deferred {
            self.open_space_checks.remove(&request);
            if self.current_request() == Some(request) {
                self.open_after_space_check(check == SpaceCheck::Pass);
            }
            return;
        }
        if let Some(txn) = deferred.transaction() {
            if !self.transactions.contains_key(&txn) {
                return match deferred {
                    Deferred::Commit { reply, .. } => self.reject_completion(txn, reply, "commit"),
                    Deferred::Abort { reply, .. } => self.reject_completion(txn, reply, "abort"),
                    other => {
                        let error = self.retired_error(txn);
                        self.fail_deferred(other, error);
                    }
                };
            }
        }
        match deferred {
            Deferred::OpenBackingStore { .. } => {}
            Deferred::CreateObjectStore { call, info } => {
                self.create_object_store_with(call, info, check)
            }
            Deferred::DeleteObjectStore { call, name } => {
                self.delete_object_store_with(call, name, check)
            }
            Deferred::RenameObjectStore { call, store, name } => {
                self.rename_object_store_with(call, store, name, check)
            }
            Deferred::ClearObjectStore { call, store } => {
                self.clear_object_store_with(call, store, check)
            }
            Deferred::CreateIndex { call, info } => self.create_index_with(call, info, check),
            Deferred::DeleteIndex { call, store, name } => {
                self.delete_index_with(call, store, name, check)
            }
            Deferred::RenameIndex {
                call,
                store,
                index,
                name,
            } => self.rename_index_with(call, store, index, name, check),
            Deferred::PutOrAdd(put) => self.put_or_add_with(put, check),
            Deferred::DeleteRecord { call, store, range } => {
                self.delete_record_with(call, store, range, check)
            }
            Deferred::GetRecord { call, store, range } => {
                self.get_record_with(call, store, range, check)
            }
            Deferred::GetCount { call, store, range } => {
                self.get_count_with(call, store, range, check)
            }
            Deferred::Commit {
                txn,
                handled_results,
                reply,
            } => self.commit_transaction_with(txn, handled_results, reply, check),
            Deferred::Abort { txn, reply } => self.abort_transaction_with(txn, reply, check),
        }
    }

    /// Reports `error` to whoever is waiting on `deferred`.
    fn fail_deferred(&mut self, deferred: Deferred, error: DbError) {
        match deferred {
            Deferred::OpenBackingStore { request } => {
                self.open_space_checks.remove(&request);
                if self.current_request() == Some(request) {
                    self.fail_current_request(error);
                }
            }
            Deferred::CreateObjectStore { call, .. }
            | Deferred::DeleteObjectStore { call, .. }
            | Deferred::RenameObjectStore { call, .. }
            | Deferred::ClearObjectStore { call, .. }
            | Deferred::CreateIndex { call, .. }
            | Deferred::DeleteIndex { call, .. }
            | Deferred::RenameIndex { call, .. }
            | Deferred::DeleteRecord { call, .. } => self.finish(call, Err(error)),
            Deferred::PutOrAdd(put) => self.finish(put.call, Err(error)),
            Deferred::GetRecord { call, .. } => self.finish(call, Err(error)),
            Deferred::GetCount { call, .. } => self.finish(call, Err(error)),
            Deferred::Commit { reply, .. } | Deferred::Abort { reply, .. } => reply(Err(error)),
        }
    }

    /// Delivers an operation result and remembers failures for commit.
    pub(crate) fn finish<T>(&mut self, call: Call<T>, result: Result<T>) {
        if let Err(error) = &result {
            debug!(txn = %call.txn, slot = call.slot, %error, "operation failed");
            if let Some(record) = self.transactions.get_mut(&call.txn) {
                record.failed.push(call.slot);
            }
        }
        (call.reply)(result);
    }

    /// Starts an operation on `txn`, or rejects it when the transaction is
    /// not known.
    pub(crate) fn begin_call<T>(&mut self, txn: TransactionId, reply: Reply<T>) -> Option<Call<T>> {
        if let Some(record) = self.transactions.get_mut(&txn) {
            let slot = record.next_slot();
            return Some(Call { txn, slot, reply });
        }
        reply(Err(self.retired_error(txn)));
        None
    }

    /// Classifies a transaction id that has no live record. The id names its
    /// connection, so this needs no per-transaction history.
    pub(crate) fn retired(&self, txn: TransactionId) -> Retired {
        let owner = txn.connection();
        match self.connections.get(&owner) {
            Some(record) if record.issued(txn) => {
                if self.open_connections.contains(&owner) {
                    Retired::Finished
                } else {
                    Retired::ConnectionGone
                }
            }
            Some(_) => Retired::NeverIssued,
            None if owner.0 > 0 && owner.0 < self.next_connection && txn.number() > 0 => {
                Retired::ConnectionGone
            }
            None => Retired::NeverIssued,
        }
    }

    /// Error for an operation on a transaction without a live record.
    pub(crate) fn retired_error(&self, txn: TransactionId) -> DbError {
        match self.retired(txn) {
            Retired::ConnectionGone => DbError::invalid_state("database or transaction is closed"),
            Retired::Finished => DbError::unknown(format!("{txn} has already finished")),
            Retired::NeverIssued => DbError::unknown(format!("{txn} is not tracked")),
        }
    }

    pub(crate) fn with_backing_store<T>(
        &mut self,
        op: impl FnOnce(&mut dyn BackingStore) -> Result<T>,
    ) -> Result<T> {
        match self.backing_store.as_deref_mut() {
            Some(store) => op(store),
            None => Err(DbError::invalid_state("backing store is closed")),
        }
    }

    pub(crate) fn current_version(&self) -> u64 {
        self.info.as_ref().map_or(0, |info| info.version)
    }

    fn next_transaction_id(&mut self, connection: ConnectionId) -> Result<TransactionId> {
        let record = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| DbError::invalid_state(format!("{connection} is closed")))?;
        let txn = TransactionId::new(connection, record.next_transaction)
            .ok_or_else(|| DbError::invalid_state(format!("{connection} id is out of range")))?;
        record.next_transaction = record
            .next_transaction
            .checked_add(1)
            .ok_or_else(|| DbError::invalid_state(format!("{connection} ran out of transaction ids")))?;
        Ok(txn)
    }

    fn next_connection_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        id
    }

    #[cfg(test)]
    pub(crate) fn live_transaction_records(&self) -> usize {
        self.transactions.len()
    }

    #[cfg(test)]
    pub(crate) fn connection_transaction_count(&self, connection: ConnectionId) -> usize {
        self.connections
            .get(&connection)
            .map_or(0, |record| record.transactions.len())
    }

    #[cfg(test)]
    pub(crate) fn scope_usage(&self, store: ObjectStoreId) -> (u32, bool) {
        let usage = self.scheduler.usage(store);
        (usage.transactions, usage.writer)
    }
}
