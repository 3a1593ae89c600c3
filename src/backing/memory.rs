use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::{BackingStore, BackingStoreFactory};
use crate::error::{DbError, Result};
use crate::schema::{DatabaseInfo, IndexInfo, ObjectStoreInfo};
use crate::types::{
    DatabaseIdentifier, IndexId, IndexKeys, Key, KeyRange, ObjectStoreId, TransactionId,
    TransactionInfo, TransactionMode, Value,
};

/// Largest key a generator may hand out (2^53).
const MAX_GENERATED_KEY: u64 = 1 << 53;

/// Behaviour switches for [`MemoryBackingStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryOptions {
    /// Report the store as ephemeral so idle closes are refused.
    pub ephemeral: bool,
    /// Allow read-write transactions on disjoint scopes to overlap.
    pub simultaneous_read_write: bool,
}

/// One call observed by a memory store, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Database the call was made against.
    pub database: String,
    /// Backing-store operation name.
    pub op: &'static str,
}

#[derive(Debug, Clone, Default)]
struct StoredRecord {
    value: Value,
    index_keys: IndexKeys,
}

#[derive(Debug, Clone, Default)]
struct StoreData {
    records: BTreeMap<Key, StoredRecord>,
    key_generator: u64,
    /// Numbers below `key_generator` handed back by failed writes.
    returned_keys: BTreeSet<u64>,
    index_entries: BTreeMap<IndexId, BTreeSet<(Key, Key)>>,
}

impl StoreData {
    fn remove_record(&mut self, key: &Key) {
        let Some(record) = self.records.remove(key) else {
            return;
        };
        for (index, index_key) in &record.index_keys {
            if let Some(entries) = self.index_entries.get_mut(index) {
                for entry in index_key.entries() {
                    entries.remove(&(entry.clone(), key.clone()));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    info: Option<DatabaseInfo>,
    stores: BTreeMap<ObjectStoreId, StoreData>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_begins: u32,
    fail_establish: bool,
}

#[derive(Debug)]
struct ActiveTransaction {
    mode: TransactionMode,
    snapshot: Option<MemoryState>,
}

/// Engine that keeps every database in process memory.
///
/// State survives [`BackingStore::close`] as long as the factory that created
/// the store is alive, so reopening a database sees committed data.
pub struct MemoryBackingStore {
    id: DatabaseIdentifier,
    options: MemoryOptions,
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
    journal: Arc<Mutex<Vec<JournalEntry>>>,
    transactions: FxHashMap<TransactionId, ActiveTransaction>,
}

impl MemoryBackingStore {
    fn record(&self, op: &'static str) {
        trace!(database = %self.id, op, "memory backing store call");
        self.journal.lock().push(JournalEntry {
            database: self.id.name.clone(),
            op,
        });
    }

    fn transaction(&self, txn: TransactionId) -> Result<&ActiveTransaction> {
        self.transactions
            .get(&txn)
            .ok_or_else(|| DbError::unknown(format!("{txn} is not running in the backing store")))
    }

    fn writable(&self, txn: TransactionId) -> Result<()> {
        if self.transaction(txn)?.mode.is_read_only() {
            return Err(DbError::invalid_state(format!("{txn} is read-only")));
        }
        Ok(())
    }

    fn version_change(&self, txn: TransactionId) -> Result<()> {
        if self.transaction(txn)?.mode != TransactionMode::VersionChange {
            return Err(DbError::invalid_state(format!(
                "{txn} cannot change the schema outside a version change"
            )));
        }
        Ok(())
    }
}

fn missing_store(store: ObjectStoreId) -> DbError {
    DbError::unknown(format!("{store} does not exist in the backing store"))
}

impl BackingStore for MemoryBackingStore {
    fn get_or_establish_database_info(&mut self) -> Result<DatabaseInfo> {
        self.record("get_or_establish_database_info");
        if self.faults.lock().fail_establish {
            return Err(DbError::invalid_state("failed to read database info"));
        }
        let mut state = self.state.lock();
        let info = state
            .info
            .get_or_insert_with(|| DatabaseInfo::new(self.id.name.clone(), 0));
        Ok(info.clone())
    }

    fn database_version(&self) -> u64 {
        self.state.lock().info.as_ref().map_or(0, |info| info.version)
    }

    fn object_store_info(&self, store: ObjectStoreId) -> Option<ObjectStoreInfo> {
        self.state
            .lock()
            .info
            .as_ref()
            .and_then(|info| info.object_store(store).cloned())
    }

    fn begin_transaction(&mut self, info: &TransactionInfo) -> Result<()> {
        self.record("begin_transaction");
        {
            let mut faults = self.faults.lock();
            if faults.fail_begins > 0 {
                faults.fail_begins -= 1;
                return Err(DbError::unknown(format!("failed to begin {}", info.id)));
            }
        }
        if self.transactions.contains_key(&info.id) {
            return Err(DbError::invalid_state(format!("{} already running", info.id)));
        }
        let mut state = self.state.lock();
        let snapshot = (!info.mode.is_read_only()).then(|| state.clone());
        if let Some(version) = info.new_version {
            let name = self.id.name.clone();
            state
                .info
                .get_or_insert_with(|| DatabaseInfo::new(name, 0))
                .version = version;
        }
        self.transactions.insert(
            info.id,
            ActiveTransaction {
                mode: info.mode,
                snapshot,
            },
        );
        Ok(())
    }

    fn commit_transaction(&mut self, txn: TransactionId) -> Result<()> {
        self.record("commit_transaction");
        self.transactions
            .remove(&txn)
            .map(|_| ())
            .ok_or_else(|| DbError::unknown(format!("{txn} is not running in the backing store")))
    }

    fn abort_transaction(&mut self, txn: TransactionId) -> Result<()> {
        self.record("abort_transaction");
        let active = self
            .transactions
            .remove(&txn)
            .ok_or_else(|| DbError::unknown(format!("{txn} is not running in the backing store")))?;
        if let Some(snapshot) = active.snapshot {
            *self.state.lock() = snapshot;
        }
        Ok(())
    }

    fn create_object_store(&mut self, txn: TransactionId, info: &ObjectStoreInfo) -> Result<()> {
        self.record("create_object_store");
        self.version_change(txn)?;
        let mut state = self.state.lock();
        let schema = state
            .info
            .as_mut()
            .ok_or_else(|| DbError::invalid_state("database info not established"))?;
        if schema.object_store(info.id).is_some() || schema.object_store_named(&info.name).is_some()
        {
            return Err(DbError::constraint(format!(
                "object store '{}' already exists",
                info.name
            )));
        }
        schema.add_object_store(info.clone());
        state.stores.insert(info.id, StoreData::default());
        Ok(())
    }

    fn delete_object_store(&mut self, txn: TransactionId, store: ObjectStoreId) -> Result<()> {
        self.record("delete_object_store");
        self.version_change(txn)?;
        let mut state = self.state.lock();
        state
            .info
            .as_mut()
            .and_then(|info| info.delete_object_store(store))
            .ok_or_else(|| missing_store(store))?;
        state.stores.remove(&store);
        Ok(())
    }

    fn rename_object_store(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        name: &str,
    ) -> Result<()> {
        self.record("rename_object_store");
        self.version_change(txn)?;
        let mut state = self.state.lock();
        let renamed = state
            .info
            .as_mut()
            .is_some_and(|info| info.rename_object_store(store, name));
        if !renamed {
            return Err(missing_store(store));
        }
        Ok(())
    }

    fn clear_object_store(&mut self, txn: TransactionId, store: ObjectStoreId) -> Result<()> {
        self.record("clear_object_store");
        self.writable(txn)?;
        let mut state = self.state.lock();
        let data = state.stores.get_mut(&store).ok_or_else(|| missing_store(store))?;
        data.records.clear();
        data.index_entries.values_mut().for_each(BTreeSet::clear);
        Ok(())
    }

    fn create_index(&mut self, txn: TransactionId, info: &IndexInfo) -> Result<()> {
        self.record("create_index");
        self.version_change(txn)?;
        let mut state = self.state.lock();
        let store = state
            .info
            .as_mut()
            .and_then(|schema| schema.object_store_mut(info.object_store))
            .ok_or_else(|| missing_store(info.object_store))?;
        if store.index_named(&info.name).is_some() {
            return Err(DbError::constraint(format!(
                "index '{}' already exists",
                info.name
            )));
        }
        store.add_index(info.clone());
        if let Some(schema) = state.info.as_mut() {
            schema.set_max_index_id(info.id);
        }
        state
            .stores
            .entry(info.object_store)
            .or_default()
            .index_entries
            .insert(info.id, BTreeSet::new());
        Ok(())
    }

    fn delete_index(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        index: IndexId,
    ) -> Result<()> {
        self.record("delete_index");
        self.version_change(txn)?;
        let mut state = self.state.lock();
        state
            .info
            .as_mut()
            .and_then(|schema| schema.object_store_mut(store))
            .and_then(|info| info.delete_index(index))
            .ok_or_else(|| DbError::unknown(format!("{index} does not exist")))?;
        if let Some(data) = state.stores.get_mut(&store) {
            data.index_entries.remove(&index);
        }
        Ok(())
    }

    fn rename_index(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        index: IndexId,
        name: &str,
    ) -> Result<()> {
        self.record("rename_index");
        self.version_change(txn)?;
        let mut state = self.state.lock();
        let info = state
            .info
            .as_mut()
            .and_then(|schema| schema.object_store_mut(store))
            .and_then(|info| info.indexes.get_mut(&index))
            .ok_or_else(|| DbError::unknown(format!("{index} does not exist")))?;
        info.name = name.to_owned();
        Ok(())
    }

    fn generate_key_number(&mut self, txn: TransactionId, store: ObjectStoreId) -> Result<u64> {
        self.record("generate_key_number");
        self.writable(txn)?;
        let mut state = self.state.lock();
        let data = state.stores.get_mut(&store).ok_or_else(|| missing_store(store))?;
        if let Some(number) = data.returned_keys.pop_first() {
            return Ok(number);
        }
        if data.key_generator >= MAX_GENERATED_KEY {
            return Err(DbError::constraint("key generator exhausted"));
        }
        data.key_generator += 1;
        Ok(data.key_generator)
    }

    fn revert_generated_key_number(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        number: u64,
    ) -> Result<()> {
        self.record("revert_generated_key_number");
        self.writable(txn)?;
        let mut state = self.state.lock();
        let data = state.stores.get_mut(&store).ok_or_else(|| missing_store(store))?;
        if number == 0 || number > data.key_generator {
            return Ok(());
        }
        if number < data.key_generator {
            data.returned_keys.insert(number);
            return Ok(());
        }
        data.key_generator = number - 1;
        while data.key_generator > 0 && data.returned_keys.remove(&data.key_generator) {
            data.key_generator -= 1;
        }
        Ok(())
    }

    fn maybe_update_key_generator_number(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        number: f64,
    ) -> Result<()> {
        self.record("maybe_update_key_generator_number");
        self.writable(txn)?;
        let mut state = self.state.lock();
        let data = state.stores.get_mut(&store).ok_or_else(|| missing_store(store))?;
        let floor = number.floor();
        if floor >= MAX_GENERATED_KEY as f64 {
            data.key_generator = MAX_GENERATED_KEY;
        } else if floor >= 1.0 && floor as u64 > data.key_generator {
            data.key_generator = floor as u64;
        } else {
            return Ok(());
        }
        // Explicit keys move the generator past anything handed back.
        data.returned_keys.clear();
        Ok(())
    }

    fn key_exists(&mut self, txn: TransactionId, store: ObjectStoreId, key: &Key) -> Result<bool> {
        self.record("key_exists");
        self.transaction(txn)?;
        let state = self.state.lock();
        let data = state.stores.get(&store).ok_or_else(|| missing_store(store))?;
        Ok(data.records.contains_key(key))
    }

    fn delete_range(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        range: &KeyRange,
    ) -> Result<()> {
        self.record("delete_range");
        self.writable(txn)?;
        let mut state = self.state.lock();
        let data = state.stores.get_mut(&store).ok_or_else(|| missing_store(store))?;
        let doomed: Vec<Key> = data
            .records
            .keys()
            .filter(|key| range.contains(key))
            .cloned()
            .collect();
        for key in &doomed {
            data.remove_record(key);
        }
        Ok(())
    }

    fn add_record(
        &mut self,
        txn: TransactionId,
        store: &ObjectStoreInfo,
        key: &Key,
        index_keys: &IndexKeys,
        value: &Value,
    ) -> Result<()> {
        self.record("add_record");
        self.writable(txn)?;
        let mut state = self.state.lock();
        let data = state
            .stores
            .get_mut(&store.id)
            .ok_or_else(|| missing_store(store.id))?;
        for (index_id, index_key) in index_keys {
            let Some(index) = store.indexes.get(index_id) else {
                continue;
            };
            if !index.unique {
                continue;
            }
            let Some(entries) = data.index_entries.get(index_id) else {
                continue;
            };
            for entry in index_key.entries() {
                let taken = entries
                    .iter()
                    .any(|(existing, owner)| existing == entry && owner != key);
                if taken {
                    return Err(DbError::constraint(format!(
                        "unique index '{}' already contains the key",
                        index.name
                    )));
                }
            }
        }
        for (index_id, index_key) in index_keys {
            let entries = data.index_entries.entry(*index_id).or_default();
            for entry in index_key.entries() {
                entries.insert((entry.clone(), key.clone()));
            }
        }
        data.records.insert(
            key.clone(),
            StoredRecord {
                value: value.clone(),
                index_keys: index_keys.clone(),
            },
        );
        Ok(())
    }

    fn get_record(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        range: &KeyRange,
    ) -> Result<Option<(Key, Value)>> {
        self.record("get_record");
        self.transaction(txn)?;
        let state = self.state.lock();
        let data = state.stores.get(&store).ok_or_else(|| missing_store(store))?;
        Ok(data
            .records
            .iter()
            .find(|(key, _)| range.contains(key))
            .map(|(key, record)| (key.clone(), record.value.clone())))
    }

    fn count(&mut self, txn: TransactionId, store: ObjectStoreId, range: &KeyRange) -> Result<u64> {
        self.record("count");
        self.transaction(txn)?;
        let state = self.state.lock();
        let data = state.stores.get(&store).ok_or_else(|| missing_store(store))?;
        Ok(data.records.keys().filter(|key| range.contains(key)).count() as u64)
    }

    fn supports_simultaneous_read_write_transactions(&self) -> bool {
        self.options.simultaneous_read_write
    }

    fn is_ephemeral(&self) -> bool {
        self.options.ephemeral
    }

    fn delete_backing_store(&mut self) -> Result<()> {
        self.record("delete_backing_store");
        *self.state.lock() = MemoryState::default();
        self.transactions.clear();
        debug!(database = %self.id, "memory backing store deleted");
        Ok(())
    }

    fn close(&mut self) {
        self.record("close");
        self.transactions.clear();
    }
}

/// Factory handing out [`MemoryBackingStore`]s that share state per database.
#[derive(Clone, Default)]
pub struct MemoryBackingStoreFactory {
    options: MemoryOptions,
    databases: Arc<Mutex<HashMap<DatabaseIdentifier, Arc<Mutex<MemoryState>>>>>,
    faults: Arc<Mutex<Faults>>,
    journal: Arc<Mutex<Vec<JournalEntry>>>,
}

impl MemoryBackingStoreFactory {
    /// Factory whose stores behave according to `options`.
    pub fn new(options: MemoryOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Makes the next `count` calls to `begin_transaction` fail.
    pub fn fail_next_begins(&self, count: u32) {
        self.faults.lock().fail_begins = count;
    }

    /// Makes loading database info fail until reset.
    pub fn fail_establish(&self, fail: bool) {
        self.faults.lock().fail_establish = fail;
    }

    /// Every backing-store call made so far.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    /// Names of the calls made so far, without the database name.
    pub fn journal_ops(&self) -> Vec<&'static str> {
        self.journal.lock().iter().map(|entry| entry.op).collect()
    }

    /// Forgets recorded calls.
    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    /// Number of records currently stored in `store` of database `id`.
    pub fn record_count(&self, id: &DatabaseIdentifier, store: ObjectStoreId) -> usize {
        self.databases
            .lock()
            .get(id)
            .map(|state| {
                state
                    .lock()
                    .stores
                    .get(&store)
                    .map_or(0, |data| data.records.len())
            })
            .unwrap_or(0)
    }
}

impl BackingStoreFactory for MemoryBackingStoreFactory {
    fn create_backing_store(&self, id: &DatabaseIdentifier) -> Result<Box<dyn BackingStore>> {
        let state = self
            .databases
            .lock()
            .entry(id.clone())
            .or_default()
            .clone();
        Ok(Box::new(MemoryBackingStore {
            id: id.clone(),
            options: self.options,
            state,
            faults: Arc::clone(&self.faults),
            journal: Arc::clone(&self.journal),
            transactions: FxHashMap::default(),
        }))
    }
}
