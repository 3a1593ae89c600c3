use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::IndexId;

/// Record key. Ordering follows the usual object-store rules: numbers sort
/// before dates, dates before strings, strings before binaries and binaries
/// before arrays.
#[derive(Debug, Clone)]
pub enum Key {
    /// Absent key; also the placeholder clients use for keys the server generates.
    Invalid,
    /// Floating point number.
    Number(f64),
    /// Milliseconds since the epoch.
    Date(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Binary(Vec<u8>),
    /// Compound key.
    Array(Vec<Key>),
}

impl Key {
    /// Whether the key can address a record.
    pub fn is_valid(&self) -> bool {
        match self {
            Key::Invalid => false,
            Key::Number(n) | Key::Date(n) => !n.is_nan(),
            Key::Array(items) => items.iter().all(Key::is_valid),
            Key::String(_) | Key::Binary(_) => true,
        }
    }

    /// Numeric payload when the key is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Invalid => 0,
            Key::Number(_) => 1,
            Key::Date(_) => 2,
            Key::String(_) => 3,
            Key::Binary(_) => 4,
            Key::Array(_) => 5,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) | (Key::Date(a), Key::Date(b)) => a.total_cmp(b),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Binary(a), Key::Binary(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl From<f64> for Key {
    fn from(value: f64) -> Self {
        Key::Number(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::String(value.to_owned())
    }
}

/// Inclusive-or-exclusive key interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Lower bound; `None` is unbounded.
    pub lower: Option<Key>,
    /// Upper bound; `None` is unbounded.
    pub upper: Option<Key>,
    /// Whether the lower bound itself is excluded.
    pub lower_open: bool,
    /// Whether the upper bound itself is excluded.
    pub upper_open: bool,
}

impl KeyRange {
    /// Range matching exactly one key.
    pub fn only(key: Key) -> Self {
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    /// Range matching every key.
    pub fn all() -> Self {
        Self {
            lower: None,
            upper: None,
            lower_open: false,
            upper_open: false,
        }
    }

    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &Key) -> bool {
        let above_lower = match &self.lower {
            None => true,
            Some(lower) if self.lower_open => key > lower,
            Some(lower) => key >= lower,
        };
        let below_upper = match &self.upper {
            None => true,
            Some(upper) if self.upper_open => key < upper,
            Some(upper) => key <= upper,
        };
        above_lower && below_upper
    }
}

/// Serialized record value plus the blob references it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Value {
    /// Serialized payload.
    pub data: Vec<u8>,
    /// URLs of blobs referenced by the payload.
    pub blob_urls: Vec<String>,
    /// On-disk paths of blobs referenced by the payload.
    pub blob_file_paths: Vec<String>,
}

impl Value {
    /// Value without blob references.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }
}

/// Key extracted for one index from a record value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKey {
    /// Single index entry.
    One(Key),
    /// One entry per member of a multi-entry index.
    Multi(Vec<Key>),
}

impl IndexKey {
    /// Replaces placeholder keys with the key generated by the server.
    pub fn update_placeholder_keys(&mut self, generated: &Key) {
        match self {
            IndexKey::One(key) => replace_placeholder(key, generated),
            IndexKey::Multi(keys) => keys
                .iter_mut()
                .for_each(|key| replace_placeholder(key, generated)),
        }
    }

    /// Entries this index key contributes to the index.
    pub fn entries(&self) -> &[Key] {
        match self {
            IndexKey::One(key) => std::slice::from_ref(key),
            IndexKey::Multi(keys) => keys,
        }
    }
}

fn replace_placeholder(key: &mut Key, generated: &Key) {
    match key {
        Key::Invalid => *key = generated.clone(),
        Key::Array(items) => items
            .iter_mut()
            .for_each(|item| replace_placeholder(item, generated)),
        _ => {}
    }
}

/// Index keys of one record, by index.
pub type IndexKeys = BTreeMap<IndexId, IndexKey>;
