//! Scope-conflict scheduling of ordinary transactions.
//!
//! The scheduler owns the pending queue, the in-progress set and the
//! per-object-store usage counters. Counters change only through
//! [`Scheduler::schedule`] (activation) and [`Scheduler::complete`], so they
//! always describe the in-progress set exactly.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::types::{ConnectionId, ObjectStoreId, Scope, TransactionId, TransactionMode};

/// Transaction as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) id: TransactionId,
    pub(crate) mode: TransactionMode,
    pub(crate) scope: Scope,
    pub(crate) owner: ConnectionId,
}

impl Entry {
    fn overlaps<F: Fn(ObjectStoreId) -> bool>(&self, held: F) -> bool {
        self.scope.iter().any(|store| held(*store))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ScopeUsage {
    pub(crate) transactions: u32,
    pub(crate) writer: bool,
}

/// Result of one scheduling pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Pass {
    pub(crate) activated: Vec<TransactionId>,
    pub(crate) deferred: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    pending: VecDeque<Entry>,
    in_progress: FxHashMap<TransactionId, Entry>,
    usage: FxHashMap<ObjectStoreId, ScopeUsage>,
    version_change: Option<TransactionId>,
}

impl Scheduler {
    pub(crate) fn enqueue(&mut self, entry: Entry) {
        debug_assert!(entry.mode != TransactionMode::VersionChange);
        self.pending.push_back(entry);
    }

    /// Puts a version-change transaction in progress. It holds the whole
    /// database, so it takes no scope counters.
    pub(crate) fn admit_version_change(&mut self, id: TransactionId, owner: ConnectionId) {
        self.version_change = Some(id);
        self.in_progress.insert(
            id,
            Entry {
                id,
                mode: TransactionMode::VersionChange,
                scope: Scope::new(),
                owner,
            },
        );
    }

    /// Activates every transaction that can start now.
    ///
    /// Stops after the first activation that happened in a pass which also
    /// deferred something, so work behind a blocked transaction is not
    /// reordered past it more than once per pass.
    pub(crate) fn schedule(&mut self, simultaneous_read_write: bool) -> Pass {
        let mut pass = Pass::default();
        loop {
            let (next, deferred) = self.take_next_runnable(simultaneous_read_write);
            pass.deferred += deferred;
            let Some(entry) = next else {
                break;
            };
            self.activate(entry, &mut pass);
            if deferred > 0 {
                break;
            }
        }
        pass
    }

    fn activate(&mut self, entry: Entry, pass: &mut Pass) {
        for store in &entry.scope {
            let usage = self.usage.entry(*store).or_default();
            usage.transactions += 1;
            if !entry.mode.is_read_only() {
                usage.writer = true;
            }
        }
        trace!(txn = %entry.id, mode = ?entry.mode, "transaction scheduled");
        pass.activated.push(entry.id);
        self.in_progress.insert(entry.id, entry);
    }

    fn take_next_runnable(&mut self, simultaneous_read_write: bool) -> (Option<Entry>, usize) {
        if self.version_change.is_some() || self.pending.is_empty() {
            return (None, 0);
        }

        let writer_in_progress = self
            .in_progress
            .values()
            .any(|entry| !entry.mode.is_read_only());
        let mut deferred: Vec<Entry> = Vec::new();
        let mut deferred_write_scopes: FxHashSet<ObjectStoreId> = FxHashSet::default();
        let mut runnable = None;

        while let Some(entry) = self.pending.pop_front() {
            let reserved = |store: ObjectStoreId| deferred_write_scopes.contains(&store);
            let conflicts = match entry.mode {
                TransactionMode::ReadOnly => {
                    entry.overlaps(reserved)
                        || entry.overlaps(|store| self.usage.get(&store).is_some_and(|u| u.writer))
                }
                TransactionMode::ReadWrite => {
                    let held = entry.overlaps(|store| {
                        self.usage.get(&store).is_some_and(|u| u.transactions > 0)
                    });
                    held || entry.overlaps(reserved)
                        || (!simultaneous_read_write && writer_in_progress)
                }
                TransactionMode::VersionChange => {
                    // Version changes are admitted by the request path only.
                    deferred.push(entry);
                    continue;
                }
            };
            if !conflicts {
                runnable = Some(entry);
                break;
            }
            if entry.mode == TransactionMode::ReadWrite {
                deferred_write_scopes.extend(entry.scope.iter().copied());
            }
            deferred.push(entry);
        }

        let count = deferred.len();
        for entry in deferred.into_iter().rev() {
            self.pending.push_front(entry);
        }
        (runnable, count)
    }

    /// Removes a transaction from the in-progress set and releases its
    /// scopes. Returns `None` if it was not in progress.
    pub(crate) fn complete(&mut self, id: TransactionId) -> Option<Entry> {
        let entry = self.in_progress.remove(&id)?;
        for store in &entry.scope {
            if let Some(usage) = self.usage.get_mut(store) {
                usage.transactions = usage.transactions.saturating_sub(1);
                if !entry.mode.is_read_only() {
                    usage.writer = false;
                }
                if usage.transactions == 0 {
                    self.usage.remove(store);
                }
            }
        }
        if self.version_change == Some(id) {
            self.version_change = None;
        }
        Some(entry)
    }

    /// Drops queued transactions owned by `owner` and returns their ids.
    pub(crate) fn remove_pending_of(&mut self, owner: ConnectionId) -> Vec<TransactionId> {
        let mut removed = Vec::new();
        self.pending.retain(|entry| {
            if entry.owner == owner {
                removed.push(entry.id);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drops every queued transaction and returns their ids.
    pub(crate) fn drain_pending(&mut self) -> Vec<TransactionId> {
        self.pending.drain(..).map(|entry| entry.id).collect()
    }

    #[cfg(test)]
    pub(crate) fn is_in_progress(&self, id: TransactionId) -> bool {
        self.in_progress.contains_key(&id)
    }

    /// In-progress transactions, sorted by id.
    pub(crate) fn in_progress_ids(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self.in_progress.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// In-progress transactions owned by `owner`, sorted by id.
    pub(crate) fn in_progress_of(&self, owner: ConnectionId) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self
            .in_progress
            .values()
            .filter(|entry| entry.owner == owner)
            .map(|entry| entry.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Queued transactions in queue order.
    pub(crate) fn pending_ids(&self) -> Vec<TransactionId> {
        self.pending.iter().map(|entry| entry.id).collect()
    }

    pub(crate) fn usage(&self, store: ObjectStoreId) -> ScopeUsage {
        self.usage.get(&store).copied().unwrap_or_default()
    }

    /// Forgets all scope counters; used once everything has been aborted.
    pub(crate) fn reset_usage(&mut self) {
        self.usage.clear();
    }

    #[cfg(test)]
    pub(crate) fn entry(&self, id: TransactionId) -> Option<&Entry> {
        self.in_progress.get(&id)
    }
}
