//! Asynchronous space admission for mutating operations.
//!
//! The coordinator never blocks on the [`QuotaArbiter`]. Each request carries
//! a [`SpaceReply`]; answering it drops a [`SpaceDecision`] into the
//! coordinator's [`SpaceInbox`] and wakes whoever waits on the inbox. The
//! coordinator then resumes the parked operation with a fixed
//! [`SpaceCheck`].

mod cost;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Byte-cost estimates used when asking for space.
pub use cost::{CostModel, DefaultCostModel, DEFAULT_WRITE_COST};

/// Outcome of the space check attached to an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheck {
    /// Not asked yet; the operation must park and ask the arbiter.
    Unknown,
    /// Space granted.
    Pass,
    /// Space denied.
    Fail,
}

impl SpaceCheck {
    pub(crate) fn from_granted(granted: bool) -> Self {
        if granted {
            SpaceCheck::Pass
        } else {
            SpaceCheck::Fail
        }
    }
}

/// Handle identifying one parked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceTicket(pub(crate) u64);

/// Arbiter answer waiting to be applied by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceDecision {
    /// Operation the answer belongs to.
    pub ticket: SpaceTicket,
    /// Whether the space was granted.
    pub granted: bool,
}

/// Mailbox of arbiter answers for one coordinator.
#[derive(Debug, Default)]
pub struct SpaceInbox {
    queue: Mutex<VecDeque<SpaceDecision>>,
    notify: Notify,
}

impl SpaceInbox {
    /// Empty inbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until at least one answer has been posted since the last wait.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Whether answers are waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn post(&self, decision: SpaceDecision) {
        self.queue.lock().push_back(decision);
        self.notify.notify_one();
    }

    pub(crate) fn drain(&self) -> Vec<SpaceDecision> {
        self.queue.lock().drain(..).collect()
    }
}

/// One-shot answer channel handed to a [`QuotaArbiter`].
///
/// Dropping a reply without answering leaves the operation parked forever,
/// which stalls only the transaction or request that asked.
#[derive(Debug)]
pub struct SpaceReply {
    ticket: SpaceTicket,
    inbox: Arc<SpaceInbox>,
}

impl SpaceReply {
    pub(crate) fn new(ticket: SpaceTicket, inbox: Arc<SpaceInbox>) -> Self {
        Self { ticket, inbox }
    }

    /// Ticket of the parked operation.
    pub fn ticket(&self) -> SpaceTicket {
        self.ticket
    }

    /// Delivers the arbiter's answer.
    pub fn answer(self, granted: bool) {
        trace!(ticket = self.ticket.0, granted, "space answer posted");
        self.inbox.post(SpaceDecision {
            ticket: self.ticket,
            granted,
        });
    }

    /// Grants the space.
    pub fn grant(self) {
        self.answer(true);
    }

    /// Denies the space.
    pub fn deny(self) {
        self.answer(false);
    }
}

/// External policy deciding whether an origin may use more space.
pub trait QuotaArbiter: Send + Sync {
    /// Asks for `cost` bytes on behalf of `origin`. The answer may be given
    /// synchronously or at any later time through `reply`.
    fn request_space(&self, origin: &str, cost: u64, reply: SpaceReply);
}

/// Arbiter that grants everything immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedQuota;

impl QuotaArbiter for UnlimitedQuota {
    fn request_space(&self, _origin: &str, _cost: u64, reply: SpaceReply) {
        reply.grant();
    }
}

/// Arbiter granting each origin a fixed byte budget.
///
/// Granted costs are charged against the budget and never refunded, so the
/// budget bounds the total bytes admitted over the arbiter's lifetime.
#[derive(Debug)]
pub struct OriginQuota {
    limit: u64,
    used: Mutex<HashMap<String, u64>>,
}

impl OriginQuota {
    /// Budget of `limit` bytes per origin.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: Mutex::new(HashMap::new()),
        }
    }

    /// Bytes admitted so far for `origin`.
    pub fn usage(&self, origin: &str) -> u64 {
        self.used.lock().get(origin).copied().unwrap_or(0)
    }
}

impl QuotaArbiter for OriginQuota {
    fn request_space(&self, origin: &str, cost: u64, reply: SpaceReply) {
        let granted = {
            let mut used = self.used.lock();
            let entry = used.entry(origin.to_owned()).or_insert(0);
            match entry.checked_add(cost) {
                Some(total) if total <= self.limit => {
                    *entry = total;
                    true
                }
                _ => false,
            }
        };
        if !granted {
            debug!(origin, cost, limit = self.limit, "origin quota exhausted");
        }
        reply.answer(granted);
    }
}

/// Space request held by a [`DeferredQuota`].
#[derive(Debug)]
pub struct PendingSpace {
    /// Origin that asked.
    pub origin: String,
    /// Requested bytes.
    pub cost: u64,
    /// Channel for the answer.
    pub reply: SpaceReply,
}

/// Arbiter that parks every request until it is resolved by hand.
///
/// Useful for driving interleavings in tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct DeferredQuota {
    pending: Arc<Mutex<VecDeque<PendingSpace>>>,
}

impl DeferredQuota {
    /// Arbiter with nothing parked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unanswered requests.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Costs of unanswered requests, oldest first.
    pub fn pending_costs(&self) -> Vec<u64> {
        self.pending.lock().iter().map(|p| p.cost).collect()
    }

    /// Answers the oldest request. Returns `false` when nothing was parked.
    pub fn resolve_next(&self, granted: bool) -> bool {
        let next = self.pending.lock().pop_front();
        match next {
            Some(pending) => {
                pending.reply.answer(granted);
                true
            }
            None => false,
        }
    }

    /// Answers every parked request and returns how many there were.
    pub fn resolve_all(&self, granted: bool) -> usize {
        let drained: Vec<PendingSpace> = self.pending.lock().drain(..).collect();
        let count = drained.len();
        for pending in drained {
            pending.reply.answer(granted);
        }
        count
    }
}

impl QuotaArbiter for DeferredQuota {
    fn request_space(&self, origin: &str, cost: u64, reply: SpaceReply) {
        self.pending.lock().push_back(PendingSpace {
            origin: origin.to_owned(),
            cost,
            reply,
        });
    }
}
