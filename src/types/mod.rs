//! Identifiers and value types shared by every coordinator component.

mod key;

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub use key::{IndexKey, IndexKeys, Key, KeyRange, Value};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Client-chosen identifier of an open or delete request.
    RequestId,
    "req#"
);
id_type!(
    /// Identifier of a server-side connection to one database.
    ConnectionId,
    "conn#"
);
/// Identifier of a transaction: its connection in the high 32 bits and its
/// position among that connection's transactions in the low 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    const NUMBER_BITS: u32 = 32;

    /// The `number`th transaction of `connection`. `None` when the
    /// connection id does not fit.
    pub fn new(connection: ConnectionId, number: u32) -> Option<Self> {
        if connection.0 >> Self::NUMBER_BITS != 0 {
            return None;
        }
        Some(Self(connection.0 << Self::NUMBER_BITS | u64::from(number)))
    }

    /// Connection the transaction was created on.
    pub fn connection(self) -> ConnectionId {
        ConnectionId(self.0 >> Self::NUMBER_BITS)
    }

    /// Position among the connection's transactions, starting at 1.
    pub fn number(self) -> u32 {
        (self.0 & u64::from(u32::MAX)) as u32
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}.{}", self.connection().0, self.number())
    }
}
id_type!(
    /// Identifier of an object store inside one database.
    ObjectStoreId,
    "store#"
);
id_type!(
    /// Identifier of an index inside one database.
    IndexId,
    "index#"
);
id_type!(
    /// Identifier of a client process or page talking to the coordinator.
    ClientId,
    "client#"
);

/// Object stores a transaction may touch; fixed at creation.
pub type Scope = SmallVec<[ObjectStoreId; 4]>;

/// Name and origin pair identifying one logical database.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatabaseIdentifier {
    /// Database name chosen by the client.
    pub name: String,
    /// Security origin owning the database; quota is accounted per origin.
    pub origin: String,
}

impl DatabaseIdentifier {
    /// Creates an identifier from a name and an origin.
    pub fn new(name: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
        }
    }
}

impl fmt::Display for DatabaseIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.origin)
    }
}

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionMode {
    /// Reads only; may share object stores with other readers.
    ReadOnly,
    /// Reads and writes records of its scope.
    ReadWrite,
    /// Exclusive schema change created by an upgrading open request.
    VersionChange,
}

impl TransactionMode {
    /// Whether the mode never writes.
    pub fn is_read_only(self) -> bool {
        matches!(self, TransactionMode::ReadOnly)
    }
}

/// Immutable description of a transaction handed to the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    /// Transaction identifier.
    pub id: TransactionId,
    /// Access mode.
    pub mode: TransactionMode,
    /// Object stores in scope; empty for version-change transactions.
    pub scope: Scope,
    /// Target version, set only for version-change transactions.
    pub new_version: Option<u64>,
}

impl TransactionInfo {
    pub(crate) fn ordinary(id: TransactionId, mode: TransactionMode, scope: Scope) -> Self {
        Self {
            id,
            mode,
            scope,
            new_version: None,
        }
    }

    pub(crate) fn version_change(id: TransactionId, new_version: u64) -> Self {
        Self {
            id,
            mode: TransactionMode::VersionChange,
            scope: Scope::new(),
            new_version: Some(new_version),
        }
    }
}

/// How `put_or_add` treats an existing record under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteMode {
    /// Fail with a constraint error if the key exists.
    Add,
    /// Replace any existing record.
    Overwrite,
    /// Replace through a cursor; never bumps the key generator.
    OverwriteForCursor,
}
