//! Quota-gated schema and record operations, commit and abort.
//!
//! Every operation runs in up to two phases. Called with
//! [`SpaceCheck::Unknown`] it estimates its cost, parks itself under a space
//! ticket and returns. Resumed with `Pass` it touches the backing store;
//! resumed with `Fail` it reports `QuotaExceeded` and leaves storage alone.

use tracing::{debug, info, warn};

use super::{Call, Deferred, PendingPut, Reply, Retired, UniqueDatabase};
use crate::backing::BackingStore;
use crate::error::{DbError, Result};
use crate::quota::SpaceCheck;
use crate::schema::{IndexInfo, ObjectStoreInfo};
use crate::types::{
    IndexId, IndexKeys, Key, KeyRange, ObjectStoreId, OverwriteMode, TransactionId, Value,
};

/// Reverts a reserved key-generator number unless released.
pub(crate) struct KeyNumberRollback<'a> {
    store: &'a mut dyn BackingStore,
    txn: TransactionId,
    object_store: ObjectStoreId,
    number: Option<u64>,
}

impl<'a> KeyNumberRollback<'a> {
    pub(crate) fn new(
        store: &'a mut dyn BackingStore,
        txn: TransactionId,
        object_store: ObjectStoreId,
        number: Option<u64>,
    ) -> Self {
        Self {
            store,
            txn,
            object_store,
            number,
        }
    }

    fn generate(&mut self) -> Result<u64> {
        let number = self.store.generate_key_number(self.txn, self.object_store)?;
        self.number = Some(number);
        Ok(number)
    }

    fn store(&mut self) -> &mut dyn BackingStore {
        &mut *self.store
    }

    /// Keeps the number and disarms the rollback.
    fn release(mut self) -> Option<u64> {
        self.number.take()
    }
}

impl Drop for KeyNumberRollback<'_> {
    fn drop(&mut self) {
        if let Some(number) = self.number.take() {
            if let Err(error) =
                self.store
                    .revert_generated_key_number(self.txn, self.object_store, number)
            {
                warn!(txn = %self.txn, number, %error, "failed to revert generated key");
            }
        }
    }
}

impl UniqueDatabase {
    /// Creates an object store inside a version-change transaction.
    pub fn create_object_store(
        &mut self,
        txn: TransactionId,
        info: ObjectStoreInfo,
        reply: Reply<()>,
    ) {
        if let Some(call) = self.begin_call(txn, reply) {
            self.create_object_store_with(call, info, SpaceCheck::Unknown);
        }
        self.pump();
    }

    pub(crate) fn create_object_store_with(
        &mut self,
        call: Call<()>,
        info: ObjectStoreInfo,
        check: SpaceCheck,
    ) {
        match check {
            SpaceCheck::Unknown => {
                let cost = self.cost.create_object_store(&info);
                self.request_space(cost, Deferred::CreateObjectStore { call, info });
            }
            SpaceCheck::Fail => {
                self.finish(call, Err(DbError::quota_exceeded("create object store")))
            }
            SpaceCheck::Pass => {
                let result = self.with_backing_store(|store| store.create_object_store(call.txn, &info));
                if result.is_ok() {
                    debug!(txn = %call.txn, store = %info.id, name = %info.name, "object store created");
                    if let Some(schema) = self.info.as_mut() {
                        schema.add_object_store(info);
                    }
                }
                self.finish(call, result);
            }
        }
    }

    /// Deletes the object store called `name`.
    pub fn delete_object_store(&mut self, txn: TransactionId, name: String, reply: Reply<()>) {
        if let Some(call) = self.begin_call(txn, reply) {
            self.delete_object_store_with(call, name, SpaceCheck::Unknown);
        }
        self.pump();
    }

    pub(crate) fn delete_object_store_with(
        &mut self,
        call: Call<()>,
        name: String,
        check: SpaceCheck,
    ) {
        match check {
            SpaceCheck::Unknown => {
                self.request_space(0, Deferred::DeleteObjectStore { call, name })
            }
            SpaceCheck::Fail => {
                self.finish(call, Err(DbError::quota_exceeded("delete object store")))
            }
            SpaceCheck::Pass => {
                let Some(store) = self
                    .info
                    .as_ref()
                    .and_then(|schema| schema.object_store_named(&name))
                    .map(|store| store.id)
                else {
                    return self.finish(
                        call,
                        Err(DbError::unknown("attempt to delete non-existent object store")),
                    );
                };
                let result = self.with_backing_store(|backing| backing.delete_object_store(call.txn, store));
                if result.is_ok() {
                    if let Some(schema) = self.info.as_mut() {
                        schema.delete_object_store(store);
                    }
                }
                self.finish(call, result);
            }
        }
    }

    /// Renames an object store.
    pub fn rename_object_store(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        name: String,
        reply: Reply<()>,
    ) {
        if let Some(call) = self.begin_call(txn, reply) {
            self.rename_object_store_with(call, store, name, SpaceCheck::Unknown);
        }
        self.pump();
    }

    pub(crate) fn rename_object_store_with(
        &mut self,
        call: Call<()>,
        store: ObjectStoreId,
        name: String,
        check: SpaceCheck,
    ) {
        match check {
            SpaceCheck::Unknown => {
                let cost = self.cost.rename(&name);
                self.request_space(cost, Deferred::RenameObjectStore { call, store, name });
            }
            SpaceCheck::Fail => {
                self.finish(call, Err(DbError::quota_exceeded("rename object store")))
            }
            SpaceCheck::Pass => {
                if !self.has_object_store(store) {
                    return self.finish(
                        call,
                        Err(DbError::unknown("attempt to rename non-existent object store")),
                    );
                }
                let result = self.with_backing_store(|backing| backing.rename_object_store(call.txn, store, &name));
                if result.is_ok() {
                    if let Some(schema) = self.info.as_mut() {
                        schema.rename_object_store(store, &name);
                    }
                }
                self.finish(call, result);
            }
        }
    }

    /// Removes every record of an object store.
    pub fn clear_object_store(&mut self, txn: TransactionId, store: ObjectStoreId, reply: Reply<()>) {
        if let Some(call) = self.begin_call(txn, reply) {
            self.clear_object_store_with(call, store, SpaceCheck::Unknown);
        }
        self.pump();
    }

    pub(crate) fn clear_object_store_with(
        &mut self,
        call: Call<()>,
        store: ObjectStoreId,
        check: SpaceCheck,
    ) {
        match check {
            SpaceCheck::Unknown => self.request_space(0, Deferred::ClearObjectStore { call, store }),
            SpaceCheck::Fail => {
                self.finish(call, Err(DbError::quota_exceeded("clear object store")))
            }
            SpaceCheck::Pass => {
                if !self.has_object_store(store) {
                    return self.finish(
                        call,
                        Err(DbError::unknown("attempt to clear non-existent object store")),
                    );
                }
                let result = self.with_backing_store(|backing| backing.clear_object_store(call.txn, store));
                self.finish(call, result);
            }
        }
    }

    /// Adds an index to an object store.
    pub fn create_index(&mut self, txn: TransactionId, info: IndexInfo, reply: Reply<()>) {
        if let Some(call) = self.begin_call(txn, reply) {
            self.create_index_with(call, info, SpaceCheck::Unknown);
        }
        self.pump();
    }

    pub(crate) fn create_index_with(&mut self, call: Call<()>, info: IndexInfo, check: SpaceCheck) {
        match check {
            SpaceCheck::Unknown => {
                let cost = self.cost.create_index(&info);
                self.request_space(cost, Deferred::CreateIndex { call, info });
            }
            SpaceCheck::Fail => self.finish(call, Err(DbError::quota_exceeded("create index"))),
            SpaceCheck::Pass => {
                if !self.has_object_store(info.object_store) {
                    return self.finish(
                        call,
                        Err(DbError::unknown("attempt to create index in non-existent object store")),
                    );
                }
                let result = self.with_backing_store(|backing| backing.create_index(call.txn, &info));
                if result.is_ok() {
                    if let Some(schema) = self.info.as_mut() {
                        let id = info.id;
                        if let Some(store) = schema.object_store_mut(info.object_store) {
                            store.add_index(info);
                        }
                        schema.set_max_index_id(id);
                    }
                }
                self.finish(call, result);
            }
        }
    }

    /// Drops the index called `name` from an object store.
    pub fn delete_index(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        name: String,
        reply: Reply<()>,
    ) {
        if let Some(call) = self.begin_call(txn, reply) {
            self.delete_index_with(call, store, name, SpaceCheck::Unknown);
        }
        self.pump();
    }

    pub(crate) fn delete_index_with(
        &mut self,
        call: Call<()>,
        store: ObjectStoreId,
        name: String,
        check: SpaceCheck,
    ) {
        match check {
            SpaceCheck::Unknown => self.request_space(0, Deferred::DeleteIndex { call, store, name }),
            SpaceCheck::Fail => self.finish(call, Err(DbError::quota_exceeded("delete index"))),
            SpaceCheck::Pass => {
                let Some(index) = self
                    .info
                    .as_ref()
                    .and_then(|schema| schema.object_store(store))
                    .and_then(|info| info.index_named(&name))
                    .map(|index| index.id)
                else {
                    return self.finish(
                        call,
                        Err(DbError::unknown("attempt to delete non-existent index")),
                    );
                };
                let result = self.with_backing_store(|backing| backing.delete_index(call.txn, store, index));
                if result.is_ok() {
                    if let Some(info) = self.info.as_mut().and_then(|s| s.object_store_mut(store)) {
                        info.delete_index(index);
                    }
                }
                self.finish(call, result);
            }
        }
    }

    /// Renames an index.
    pub fn rename_index(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        index: IndexId,
        name: String,
        reply: Reply<()>,
    ) {
        if let Some(call) = self.begin_call(txn, reply) {
            self.rename_index_with(call, store, index, name, SpaceCheck::Unknown);
        }
        self.pump();
    }

    pub(crate) fn rename_index_with(
        &mut self,
        call: Call<()>,
        store: ObjectStoreId,
        index: IndexId,
        name: String,
        check: SpaceCheck,
    ) {
        match check {
            SpaceCheck::Unknown => {
                let cost = self.cost.rename(&name);
                self.request_space(
                    cost,
                    Deferred::RenameIndex {
                        call,
                        store,
                        index,
                        name,
                    },
                );
            }
            SpaceCheck::Fail => self.finish(call, Err(DbError::quota_exceeded("rename index"))),
            SpaceCheck::Pass => {
                let exists = self
                    .info
                    .as_ref()
                    .and_then(|schema| schema.object_store(store))
                    .is_some_and(|info| info.indexes.contains_key(&index));
                if !exists {
                    return self.finish(
                        call,
                        Err(DbError::unknown("attempt to rename non-existent index")),
                    );
                }
                let result = self.with_backing_store(|backing| backing.rename_index(call.txn, store, index, &name));
                if result.is_ok() {
                    if let Some(info) = self
                        .info
                        .as_mut()
                        .and_then(|schema| schema.object_store_mut(store))
                        .and_then(|info| info.indexes.get_mut(&index))
                    {
                        info.name = name;
                    }
                }
                self.finish(call, result);
            }
        }
    }

    /// Stores a record and replies with the key it was stored under.
    ///
    /// An auto-increment store generates a key when `key` is not valid; the
    /// generated number is handed back to the generator if any later step,
    /// including the space check, fails.
    #[allow(clippy::too_many_arguments)]
    pub fn put_or_add(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        key: Key,
        value: Value,
        index_keys: IndexKeys,
        mode: OverwriteMode,
        reply: Reply<Key>,
    ) {
        if let Some(call) = self.begin_call(txn, reply) {
            self.prepare_put(call, store, key, value, index_keys, mode);
        }
        self.pump();
    }

    fn prepare_put(
        &mut self,
        call: Call<Key>,
        store: ObjectStoreId,
        key: Key,
        value: Value,
        mut index_keys: IndexKeys,
        mode: OverwriteMode,
    ) {
        if self.quota.is_none() {
            return self.finish(call, Err(DbError::invalid_state("quota manager is unavailable")));
        }
        let txn = call.txn;
        let reserved = self.with_backing_store(|backing| {
            let info = backing.object_store_info(store).ok_or_else(|| {
                DbError::invalid_state("object store cannot be found in the backing store")
            })?;
            let (key, generated) = reserve_key(backing, txn, &info, key, mode)?;
            Ok((info, key, generated))
        });
        let (info, key, generated) = match reserved {
            Ok(reserved) => reserved,
            Err(error) => return self.finish(call, Err(error)),
        };

        // The client cannot know a server-generated key and leaves
        // placeholders in its index keys.
        if generated.is_some() {
            for index_key in index_keys.values_mut() {
                index_key.update_placeholder_keys(&key);
            }
        }

        let cost = self.cost.put(&info, &key, &value, &index_keys);
        debug!(txn = %txn, store = %store, cost, generated = generated.is_some(), "put waiting for space");
        self.request_space(
            cost,
            Deferred::PutOrAdd(Box::new(PendingPut {
                call,
                store: info,
                key,
                value,
                index_keys,
                mode,
                generated,
            })),
        );
    }

    pub(crate) fn put_or_add_with(&mut self, put: Box<PendingPut>, check: SpaceCheck) {
        let result = match self.backing_store.as_deref_mut() {
            Some(backing) => store_record(backing, &put, check),
            None => Err(DbError::invalid_state("backing store is closed")),
        };
        let PendingPut { call, key, .. } = *put;
        self.finish(call, result.map(|()| key));
    }

    /// Deletes every record in `range`.
    pub fn delete_record(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        range: KeyRange,
        reply: Reply<()>,
    ) {
        if let Some(call) = self.begin_call(txn, reply) {
            self.delete_record_with(call, store, range, SpaceCheck::Unknown);
        }
        self.pump();
    }

    pub(crate) fn delete_record_with(
        &mut self,
        call: Call<()>,
        store: ObjectStoreId,
        range: KeyRange,
        check: SpaceCheck,
    ) {
        match check {
            SpaceCheck::Unknown => {
                self.request_space(0, Deferred::DeleteRecord { call, store, range })
            }
            SpaceCheck::Fail => self.finish(call, Err(DbError::quota_exceeded("delete record"))),
            SpaceCheck::Pass => {
                let result = self.with_backing_store(|backing| backing.delete_range(call.txn, store, &range));
                self.finish(call, result);
            }
        }
    }

    /// Reads the first record in `range`.
    pub fn get_record(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        range: KeyRange,
        reply: Reply<Option<(Key, Value)>>,
    ) {
        if let Some(call) = self.begin_call(txn, reply) {
            self.get_record_with(call, store, range, SpaceCheck::Unknown);
        }
        self.pump();
    }

    pub(crate) fn get_record_with(
        &mut self,
        call: Call<Option<(Key, Value)>>,
        store: ObjectStoreId,
        range: KeyRange,
        check: SpaceCheck,
    ) {
        match check {
            SpaceCheck::Unknown => self.request_space(0, Deferred::GetRecord { call, store, range }),
            SpaceCheck::Fail => self.finish(call, Err(DbError::quota_exceeded("get record"))),
            SpaceCheck::Pass => {
                let result = self.with_backing_store(|backing| backing.get_record(call.txn, store, &range));
                self.finish(call, result);
            }
        }
    }

    /// Counts records in `range`.
    pub fn get_count(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        range: KeyRange,
        reply: Reply<u64>,
    ) {
        if let Some(call) = self.begin_call(txn, reply) {
            self.get_count_with(call, store, range, SpaceCheck::Unknown);
        }
        self.pump();
    }

    pub(crate) fn get_count_with(
        &mut self,
        call: Call<u64>,
        store: ObjectStoreId,
        range: KeyRange,
        check: SpaceCheck,
    ) {
        match check {
            SpaceCheck::Unknown => self.request_space(0, Deferred::GetCount { call, store, range }),
            SpaceCheck::Fail => self.finish(call, Err(DbError::quota_exceeded("get count"))),
            SpaceCheck::Pass => {
                let result = self.with_backing_store(|backing| backing.count(call.txn, store, &range));
                self.finish(call, result);
            }
        }
    }

    /// Commits a transaction.
    ///
    /// `handled_results` is how many operation results the client has
    /// processed. A failure among the rest aborts the transaction instead.
    pub fn commit_transaction(
        &mut self,
        txn: TransactionId,
        handled_results: usize,
        reply: Reply<()>,
    ) {
        if self.transactions.contains_key(&txn) {
            self.commit_transaction_with(txn, handled_results, reply, SpaceCheck::Unknown);
        } else {
            self.reject_completion(txn, reply, "commit");
        }
        self.pump();
    }

    pub(crate) fn commit_transaction_with(
        &mut self,
        txn: TransactionId,
        handled_results: usize,
        reply: Reply<()>,
        check: SpaceCheck,
    ) {
        match check {
            SpaceCheck::Unknown => self.request_space(
                0,
                Deferred::Commit {
                    txn,
                    handled_results,
                    reply,
                },
            ),
            SpaceCheck::Fail => reply(Err(DbError::quota_exceeded("commit transaction"))),
            SpaceCheck::Pass => {
                let unhandled = self
                    .transactions
                    .get(&txn)
                    .is_some_and(|record| record.has_unhandled_failure(handled_results));
                if unhandled {
                    warn!(txn = %txn, handled_results, "aborting transaction with unhandled failed request");
                    let reply_after_abort: Reply<()> = Box::new(move |result: Result<()>| {
                        reply(result.and(Err(DbError::unknown(
                            "transaction aborted due to unhandled failed request",
                        ))))
                    });
                    return self.abort_transaction_with(txn, reply_after_abort, SpaceCheck::Pass);
                }

                if self.backing_store.is_none() {
                    return reply(Err(DbError::invalid_state("backing store is closed")));
                }
                if self.scheduler.complete(txn).is_none() {
                    return self.not_running(txn, reply, "commit");
                }
                let result = self.with_backing_store(|backing| backing.commit_transaction(txn));
                match &result {
                    Ok(()) => info!(database = %self.identifier, txn = %txn, "transaction committed"),
                    Err(error) => warn!(database = %self.identifier, txn = %txn, %error, "commit failed"),
                }
                self.transaction_completed(txn, result.is_ok());
                reply(result);
            }
        }
    }

    /// Aborts a transaction, undoing its writes. A version change also
    /// restores the schema it started from.
    pub fn abort_transaction(&mut self, txn: TransactionId, reply: Reply<()>) {
        if self.transactions.contains_key(&txn) {
            self.abort_transaction_with(txn, reply, SpaceCheck::Unknown);
        } else {
            self.reject_completion(txn, reply, "abort");
        }
        self.pump();
    }

    pub(crate) fn abort_transaction_with(
        &mut self,
        txn: TransactionId,
        reply: Reply<()>,
        check: SpaceCheck,
    ) {
        match check {
            SpaceCheck::Unknown => self.request_space(0, Deferred::Abort { txn, reply }),
            SpaceCheck::Fail => reply(Err(DbError::quota_exceeded("abort transaction"))),
            SpaceCheck::Pass => match self.abort_running(txn) {
                Some(result) => reply(result),
                None => self.not_running(txn, reply, "abort"),
            },
        }
    }

    /// Commit or abort of an id without a live record: silently dropped
    /// when the owning connection is gone, rejected otherwise.
    pub(super) fn reject_completion(&mut self, txn: TransactionId, reply: Reply<()>, action: &str) {
        let message = match self.retired(txn) {
            Retired::ConnectionGone => {
                debug!(txn = %txn, action, "dropping completion for closed connection");
                return;
            }
            Retired::Finished => format!("attempt to {action} transaction that is not running"),
            Retired::NeverIssued => format!("attempt to {action} transaction that is not tracked"),
        };
        reply(Err(DbError::unknown(message)));
    }

    fn not_running(&mut self, txn: TransactionId, reply: Reply<()>, action: &str) {
        let Some(record) = self.transactions.get(&txn) else {
            return self.reject_completion(txn, reply, action);
        };
        if !self.open_connections.contains(&record.connection) {
            debug!(txn = %txn, action, "dropping completion for closed connection");
            return;
        }
        reply(Err(DbError::unknown(format!(
            "attempt to {action} transaction that is not running"
        ))));
    }

    fn has_object_store(&self, store: ObjectStoreId) -> bool {
        self.info
            .as_ref()
            .is_some_and(|schema| schema.object_store(store).is_some())
    }
}

/// Picks the key a record is stored under, generating one if needed, and
/// enforces no-overwrite.
fn reserve_key(
    backing: &mut dyn BackingStore,
    txn: TransactionId,
    info: &ObjectStoreInfo,
    key: Key,
    mode: OverwriteMode,
) -> Result<(Key, Option<u64>)> {
    let mut rollback = KeyNumberRollback::new(backing, txn, info.id, None);
    let key = if info.auto_increment && !key.is_valid() {
        Key::Number(rollback.generate()? as f64)
    } else {
        key
    };
    if mode == OverwriteMode::Add && rollback.store().key_exists(txn, info.id, &key)? {
        return Err(DbError::constraint("key already exists in the object store"));
    }
    Ok((key, rollback.release()))
}

fn store_record(backing: &mut dyn BackingStore, put: &PendingPut, check: SpaceCheck) -> Result<()> {
    let txn = put.call.txn;
    let mut rollback = KeyNumberRollback::new(backing, txn, put.store.id, put.generated);
    if check != SpaceCheck::Pass {
        return Err(DbError::quota_exceeded("put or add"));
    }
    // Deleting first also drops the old record's index entries.
    rollback
        .store()
        .delete_range(txn, put.store.id, &KeyRange::only(put.key.clone()))?;
    rollback
        .store()
        .add_record(txn, &put.store, &put.key, &put.index_keys, &put.value)?;
    let result = match put.key {
        Key::Number(number)
            if put.mode != OverwriteMode::OverwriteForCursor && put.store.auto_increment =>
        {
            rollback
                .store()
                .maybe_update_key_generator_number(txn, put.store.id, number)
        }
        _ => Ok(()),
    };
    rollback.release();
    result
}
