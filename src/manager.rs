//! Registry of database workers keyed by `(name, origin)`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::backing::{BackingStoreFactory, MemoryBackingStoreFactory};
use crate::config::CoordinatorConfig;
use crate::coordinator::UniqueDatabase;
use crate::metrics::{CoordinatorMetrics, NoopMetrics};
use crate::quota::{CostModel, DefaultCostModel, OriginQuota, QuotaArbiter, UnlimitedQuota};
use crate::types::DatabaseIdentifier;
use crate::worker::{self, DatabaseHandle};

/// Hands out one [`DatabaseHandle`] per database, spawning workers on first
/// use. Every coordinator shares the manager's factory, arbiter, cost model
/// and metrics.
pub struct DatabaseManager {
    factory: Arc<dyn BackingStoreFactory>,
    quota: Arc<dyn QuotaArbiter>,
    cost: Arc<dyn CostModel>,
    metrics: Arc<dyn CoordinatorMetrics>,
    databases: Mutex<HashMap<DatabaseIdentifier, DatabaseHandle>>,
}

impl DatabaseManager {
    /// Manager over the given collaborators with the default cost model and
    /// no metrics.
    pub fn new(factory: Arc<dyn BackingStoreFactory>, quota: Arc<dyn QuotaArbiter>) -> Self {
        Self {
            factory,
            quota,
            cost: Arc::new(DefaultCostModel::default()),
            metrics: Arc::new(NoopMetrics),
            databases: Mutex::new(HashMap::new()),
        }
    }

    /// Manager backed by in-memory stores, configured from `config`.
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        let factory = MemoryBackingStoreFactory::new(config.storage.into());
        let quota: Arc<dyn QuotaArbiter> = match config.quota.origin_limit_bytes {
            Some(limit) => Arc::new(OriginQuota::new(limit)),
            None => Arc::new(UnlimitedQuota),
        };
        Self::new(Arc::new(factory), quota).with_cost_model(Arc::new(
            DefaultCostModel::with_write_cost(config.quota.write_cost),
        ))
    }

    /// Replaces the cost model used by coordinators created from now on.
    pub fn with_cost_model(mut self, cost: Arc<dyn CostModel>) -> Self {
        self.cost = cost;
        self
    }

    /// Replaces the metrics sink used by coordinators created from now on.
    pub fn with_metrics(mut self, metrics: Arc<dyn CoordinatorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Handle for `identifier`, spawning its worker if needed. Must be
    /// called inside a tokio runtime.
    pub fn database(&self, identifier: &DatabaseIdentifier) -> DatabaseHandle {
        let mut databases = self.databases.lock();
        if let Some(handle) = databases.get(identifier).filter(|h| !h.is_closed()) {
            return handle.clone();
        }
        debug!(database = %identifier, "spawning database worker");
        let coordinator = UniqueDatabase::new(
            identifier.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&self.quota),
        )
        .with_cost_model(Arc::clone(&self.cost))
        .with_metrics(Arc::clone(&self.metrics));
        let handle = worker::spawn(coordinator);
        databases.insert(identifier.clone(), handle.clone());
        handle
    }

    /// Identifiers with a live worker.
    pub fn databases(&self) -> Vec<DatabaseIdentifier> {
        let mut ids: Vec<_> = self
            .databases
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stops every worker.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.databases.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(error) = handle.shutdown().await {
                debug!(database = %handle.identifier(), %error, "worker already stopped");
            }
        }
    }
}
