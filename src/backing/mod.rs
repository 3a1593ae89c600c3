//! Durable object-store engine consumed by the coordinator.
//!
//! The coordinator never reaches into storage directly; every record and
//! schema change goes through [`BackingStore`]. A [`BackingStoreFactory`]
//! creates one store per database the first time it is opened or deleted.

mod memory;

use crate::error::Result;
use crate::schema::{DatabaseInfo, IndexInfo, ObjectStoreInfo};
use crate::types::{
    DatabaseIdentifier, IndexId, IndexKeys, Key, KeyRange, ObjectStoreId, TransactionId,
    TransactionInfo, Value,
};

/// In-memory engine used for ephemeral databases and tests.
pub use memory::{JournalEntry, MemoryBackingStore, MemoryBackingStoreFactory, MemoryOptions};

/// Storage engine for one database.
///
/// Calls are made from the coordinator's worker only, one at a time.
pub trait BackingStore: Send {
    /// Loads the stored schema, creating an empty version-0 schema when the
    /// database does not exist yet.
    fn get_or_establish_database_info(&mut self) -> Result<DatabaseInfo>;

    /// Version currently persisted; 0 when nothing is stored.
    fn database_version(&self) -> u64;

    /// Stored definition of an object store.
    fn object_store_info(&self, store: ObjectStoreId) -> Option<ObjectStoreInfo>;

    /// Starts a transaction. Version-change transactions carry their target version.
    fn begin_transaction(&mut self, info: &TransactionInfo) -> Result<()>;

    /// Makes a transaction's writes durable.
    fn commit_transaction(&mut self, txn: TransactionId) -> Result<()>;

    /// Discards a transaction's writes, including schema changes.
    fn abort_transaction(&mut self, txn: TransactionId) -> Result<()>;

    /// Creates an object store.
    fn create_object_store(&mut self, txn: TransactionId, info: &ObjectStoreInfo) -> Result<()>;

    /// Deletes an object store and its records.
    fn delete_object_store(&mut self, txn: TransactionId, store: ObjectStoreId) -> Result<()>;

    /// Renames an object store.
    fn rename_object_store(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        name: &str,
    ) -> Result<()>;

    /// Removes every record from an object store.
    fn clear_object_store(&mut self, txn: TransactionId, store: ObjectStoreId) -> Result<()>;

    /// Adds an index and indexes existing records.
    fn create_index(&mut self, txn: TransactionId, info: &IndexInfo) -> Result<()>;

    /// Drops an index.
    fn delete_index(&mut self, txn: TransactionId, store: ObjectStoreId, index: IndexId)
        -> Result<()>;

    /// Renames an index.
    fn rename_index(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        index: IndexId,
        name: &str,
    ) -> Result<()>;

    /// Reserves the next key of an auto-increment store.
    fn generate_key_number(&mut self, txn: TransactionId, store: ObjectStoreId) -> Result<u64>;

    /// Hands back a key reserved by [`BackingStore::generate_key_number`].
    fn revert_generated_key_number(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        number: u64,
    ) -> Result<()>;

    /// Moves the key generator past an explicitly supplied numeric key.
    fn maybe_update_key_generator_number(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        number: f64,
    ) -> Result<()>;

    /// Whether a record exists under `key`.
    fn key_exists(&mut self, txn: TransactionId, store: ObjectStoreId, key: &Key) -> Result<bool>;

    /// Deletes every record whose key falls in `range`.
    fn delete_range(&mut self, txn: TransactionId, store: ObjectStoreId, range: &KeyRange)
        -> Result<()>;

    /// Inserts a record and its index entries.
    fn add_record(
        &mut self,
        txn: TransactionId,
        store: &ObjectStoreInfo,
        key: &Key,
        index_keys: &IndexKeys,
        value: &Value,
    ) -> Result<()>;

    /// First record whose key falls in `range`.
    fn get_record(
        &mut self,
        txn: TransactionId,
        store: ObjectStoreId,
        range: &KeyRange,
    ) -> Result<Option<(Key, Value)>>;

    /// Number of records whose key falls in `range`.
    fn count(&mut self, txn: TransactionId, store: ObjectStoreId, range: &KeyRange) -> Result<u64>;

    /// Whether read-write transactions on disjoint scopes may run at once.
    fn supports_simultaneous_read_write_transactions(&self) -> bool;

    /// Whether data lives only in memory and must not be closed while idle.
    fn is_ephemeral(&self) -> bool;

    /// Removes all durable state of the database.
    fn delete_backing_store(&mut self) -> Result<()>;

    /// Releases resources; the store is not used afterwards.
    fn close(&mut self);
}

/// Creates backing stores on demand.
pub trait BackingStoreFactory: Send + Sync {
    /// Opens (or creates) the store for `id`.
    fn create_backing_store(&self, id: &DatabaseIdentifier) -> Result<Box<dyn BackingStore>>;
}
