//! Transaction coordinator for IndexedDB-style databases.
//!
//! One [`UniqueDatabase`] serializes all work against a single
//! `(name, origin)` database: open and delete requests are admitted one at a
//! time, version changes run alone, ordinary transactions are scheduled by
//! object-store scope, and every mutation asks a [`QuotaArbiter`] for space
//! before it reaches the [`BackingStore`].
//!
//! [`worker::spawn`] runs a coordinator on its own tokio task, and
//! [`DatabaseManager`] keeps one such worker per database.

#![warn(missing_docs)]

pub mod backing;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod quota;
pub mod schema;
pub mod types;
pub mod worker;

pub use backing::{BackingStore, BackingStoreFactory, MemoryBackingStoreFactory, MemoryOptions};
pub use client::{ClientEvent, ClientLink};
pub use config::{CoordinatorConfig, ConfigError};
pub use coordinator::{DeleteOutcome, OpenOutcome, Reply, UniqueDatabase};
pub use error::{DbError, Result};
pub use manager::DatabaseManager;
pub use metrics::{CoordinatorMetrics, CounterMetrics, MetricsSnapshot, NoopMetrics};
pub use quota::{
    CostModel, DefaultCostModel, DeferredQuota, OriginQuota, QuotaArbiter, SpaceCheck,
    SpaceReply, UnlimitedQuota,
};
pub use schema::{DatabaseInfo, IndexInfo, KeyPath, ObjectStoreInfo};
pub use types::{
    ClientId, ConnectionId, DatabaseIdentifier, IndexId, IndexKey, IndexKeys, Key, KeyRange,
    ObjectStoreId, OverwriteMode, RequestId, TransactionId, TransactionMode, Value,
};
pub use worker::DatabaseHandle;
