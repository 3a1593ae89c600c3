use crate::schema::{IndexInfo, KeyPath, ObjectStoreInfo};
use crate::types::{IndexKey, IndexKeys, Key, Value};

/// Fixed cost charged for every write that asks for space.
pub const DEFAULT_WRITE_COST: u64 = 4;

/// Per-index-row overhead: three varint columns of about four bytes each.
const INDEX_ROW_BASE: u64 = 12;

/// Estimates how many bytes an operation will add to the database.
///
/// Deletes, clears, reads, commits and aborts are always charged zero; only
/// operations that grow the database go through the model.
pub trait CostModel: Send + Sync {
    /// Cost of creating `info`.
    fn create_object_store(&self, info: &ObjectStoreInfo) -> u64;

    /// Cost of creating `info`.
    fn create_index(&self, info: &IndexInfo) -> u64;

    /// Cost of renaming a store or index to `new_name`.
    fn rename(&self, new_name: &str) -> u64;

    /// Cost of storing `value` under `key` with its index entries.
    fn put(&self, store: &ObjectStoreInfo, key: &Key, value: &Value, index_keys: &IndexKeys)
        -> u64;

    /// Cost of creating a backing store for a first open.
    fn open_backing_store(&self) -> u64;
}

/// Byte estimates matching the row layout of a typical SQL-backed store.
#[derive(Debug, Clone, Copy)]
pub struct DefaultCostModel {
    /// Fixed cost added to every growing operation.
    pub write_cost: u64,
}

impl Default for DefaultCostModel {
    fn default() -> Self {
        Self {
            write_cost: DEFAULT_WRITE_COST,
        }
    }
}

impl DefaultCostModel {
    /// Model with a custom fixed write cost.
    pub fn with_write_cost(write_cost: u64) -> Self {
        Self { write_cost }
    }

    fn key_size(key: &Key) -> u64 {
        4 + match key {
            Key::String(s) => s.len() as u64,
            Key::Binary(bytes) => bytes.len() as u64,
            Key::Array(items) => items.iter().map(Self::key_size).sum(),
            Key::Invalid | Key::Number(_) | Key::Date(_) => 0,
        }
    }

    fn value_size(value: &Value) -> u64 {
        let blobs: u64 = value
            .blob_urls
            .iter()
            .chain(&value.blob_file_paths)
            .map(|s| s.len() as u64)
            .sum();
        4 + value.data.len() as u64 + blobs
    }

    fn index_rows_size(store: &ObjectStoreInfo, index_keys: &IndexKeys, primary: u64) -> u64 {
        index_keys
            .iter()
            .map(|(index, index_key)| {
                let multi_entry = store
                    .indexes
                    .get(index)
                    .is_some_and(|info| info.multi_entry);
                match index_key {
                    IndexKey::Multi(keys) if multi_entry => keys
                        .iter()
                        .map(|key| INDEX_ROW_BASE + primary + Self::key_size(key))
                        .sum(),
                    IndexKey::Multi(keys) => {
                        INDEX_ROW_BASE + primary + 4 + keys.iter().map(Self::key_size).sum::<u64>()
                    }
                    IndexKey::One(key) => INDEX_ROW_BASE + primary + Self::key_size(key),
                }
            })
            .sum()
    }
}

impl CostModel for DefaultCostModel {
    fn create_object_store(&self, info: &ObjectStoreInfo) -> u64 {
        let key_path = info.key_path.as_ref().map_or(0, KeyPath::size_in_bytes);
        self.write_cost + 4 + info.name.len() as u64 + key_path
    }

    fn create_index(&self, info: &IndexInfo) -> u64 {
        self.write_cost + 4 + info.name.len() as u64 + info.key_path.size_in_bytes()
    }

    fn rename(&self, new_name: &str) -> u64 {
        self.write_cost + new_name.len() as u64
    }

    fn put(
        &self,
        store: &ObjectStoreInfo,
        key: &Key,
        value: &Value,
        index_keys: &IndexKeys,
    ) -> u64 {
        let key_size = Self::key_size(key);
        self.write_cost
            + key_size
            + Self::value_size(value)
            + Self::index_rows_size(store, index_keys, key_size)
    }

    fn open_backing_store(&self) -> u64 {
        self.write_cost
    }
}
