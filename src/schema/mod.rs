//! In-memory mirror of a database's version and object-store definitions.
//!
//! The coordinator owns exactly one [`DatabaseInfo`] per open database and
//! mutates it only while a version-change transaction is running. A snapshot
//! taken when the version change starts is restored if it aborts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{IndexId, ObjectStoreId};

/// Key path used to extract keys from record values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// Single dotted path.
    Single(String),
    /// Compound key built from several paths.
    Compound(Vec<String>),
}

impl KeyPath {
    pub(crate) fn size_in_bytes(&self) -> u64 {
        match self {
            KeyPath::Single(path) => path.len() as u64,
            KeyPath::Compound(paths) => paths.iter().map(|p| p.len() as u64).sum(),
        }
    }
}

/// Index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Index identifier, unique within the database.
    pub id: IndexId,
    /// Object store the index belongs to.
    pub object_store: ObjectStoreId,
    /// Index name, unique within its object store.
    pub name: String,
    /// Key path evaluated against record values.
    pub key_path: KeyPath,
    /// Whether two records may not share an index key.
    pub unique: bool,
    /// Whether array values produce one entry per member.
    pub multi_entry: bool,
}

/// Object store definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreInfo {
    /// Object store identifier.
    pub id: ObjectStoreId,
    /// Object store name, unique within the database.
    pub name: String,
    /// In-line key path; `None` means keys are supplied out of line.
    pub key_path: Option<KeyPath>,
    /// Whether the store owns a key generator.
    pub auto_increment: bool,
    /// Indexes by identifier.
    pub indexes: BTreeMap<IndexId, IndexInfo>,
}

impl ObjectStoreInfo {
    /// Creates a store definition without indexes.
    pub fn new(
        id: ObjectStoreId,
        name: impl Into<String>,
        key_path: Option<KeyPath>,
        auto_increment: bool,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            key_path,
            auto_increment,
            indexes: BTreeMap::new(),
        }
    }

    /// Looks an index up by name.
    pub fn index_named(&self, name: &str) -> Option<&IndexInfo> {
        self.indexes.values().find(|index| index.name == name)
    }

    pub(crate) fn add_index(&mut self, info: IndexInfo) {
        self.indexes.insert(info.id, info);
    }

    pub(crate) fn delete_index(&mut self, id: IndexId) -> Option<IndexInfo> {
        self.indexes.remove(&id)
    }
}

/// Current version and schema of one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Database name.
    pub name: String,
    /// Committed (or in-flight, during a version change) schema version.
    pub version: u64,
    /// Highest index identifier ever assigned.
    pub max_index_id: u64,
    /// Object stores by identifier.
    pub object_stores: BTreeMap<ObjectStoreId, ObjectStoreInfo>,
}

impl DatabaseInfo {
    /// Empty schema at `version`.
    pub fn new(name: impl Into<String>, version: u64) -> Self {
        Self {
            name: name.into(),
            version,
            max_index_id: 0,
            object_stores: BTreeMap::new(),
        }
    }

    /// Looks an object store up by identifier.
    pub fn object_store(&self, id: ObjectStoreId) -> Option<&ObjectStoreInfo> {
        self.object_stores.get(&id)
    }

    /// Looks an object store up by name.
    pub fn object_store_named(&self, name: &str) -> Option<&ObjectStoreInfo> {
        self.object_stores.values().find(|store| store.name == name)
    }

    pub(crate) fn object_store_mut(&mut self, id: ObjectStoreId) -> Option<&mut ObjectStoreInfo> {
        self.object_stores.get_mut(&id)
    }

    pub(crate) fn add_object_store(&mut self, info: ObjectStoreInfo) {
        for index in info.indexes.keys() {
            self.max_index_id = self.max_index_id.max(index.0);
        }
        self.object_stores.insert(info.id, info);
    }

    pub(crate) fn delete_object_store(&mut self, id: ObjectStoreId) -> Option<ObjectStoreInfo> {
        self.object_stores.remove(&id)
    }

    pub(crate) fn rename_object_store(&mut self, id: ObjectStoreId, name: &str) -> bool {
        match self.object_stores.get_mut(&id) {
            Some(store) => {
                store.name = name.to_owned();
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_max_index_id(&mut self, id: IndexId) {
        self.max_index_id = self.max_index_id.max(id.0);
    }
}
