use std::collections::BTreeSet;

use crate::client::ClientLink;
use crate::error::{DbError, Result};
use crate::schema::DatabaseInfo;
use crate::types::{ConnectionId, RequestId, TransactionId, TransactionInfo};

use super::{DeleteOutcome, OpenOutcome, Reply};

/// What a queued request asks for.
pub(crate) enum RequestKind {
    Open {
        requested_version: Option<u64>,
        reply: Reply<OpenOutcome>,
    },
    Delete {
        reply: Reply<DeleteOutcome>,
    },
}

/// Open or delete request waiting for, or holding, the current slot.
pub(crate) struct OpenRequest {
    pub(crate) id: RequestId,
    pub(crate) client: ClientLink,
    pub(crate) kind: RequestKind,
    /// Connections sent a version-change event that have not acknowledged
    /// or closed yet. `None` until events were sent.
    pub(crate) awaiting: Option<BTreeSet<ConnectionId>>,
    pub(crate) blocked_sent: bool,
}

impl OpenRequest {
    pub(crate) fn new(id: RequestId, client: ClientLink, kind: RequestKind) -> Self {
        Self {
            id,
            client,
            kind,
            awaiting: None,
            blocked_sent: false,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self.kind, RequestKind::Open { .. })
    }

    /// Version requested by an open, with "unspecified" resolved against
    /// the stored version.
    pub(crate) fn target_version(&self, current: u64) -> Option<u64> {
        match self.kind {
            RequestKind::Open {
                requested_version, ..
            } => Some(match requested_version {
                Some(version) if version > 0 => version,
                _ if current > 0 => current,
                _ => 1,
            }),
            RequestKind::Delete { .. } => None,
        }
    }

    pub(crate) fn has_connections_pending_version_change(&self) -> bool {
        self.awaiting.as_ref().is_some_and(|set| !set.is_empty())
    }

    pub(crate) fn fail(self, error: DbError) {
        match self.kind {
            RequestKind::Open { reply, .. } => reply(Err(error)),
            RequestKind::Delete { reply } => reply(Err(error)),
        }
    }
}

/// Server-side state of one connection.
pub(crate) struct ConnectionRecord {
    pub(crate) client: ClientLink,
    pub(crate) open_request: RequestId,
    pub(crate) close_pending: bool,
    /// Live transactions: queued or in progress.
    pub(crate) transactions: BTreeSet<TransactionId>,
    /// Number the next transaction on this connection gets.
    pub(crate) next_transaction: u32,
}

impl ConnectionRecord {
    pub(crate) fn new(client: ClientLink, open_request: RequestId) -> Self {
        Self {
            client,
            open_request,
            close_pending: false,
            transactions: BTreeSet::new(),
            next_transaction: 1,
        }
    }

    /// Whether `txn` was handed out on this connection.
    pub(crate) fn issued(&self, txn: TransactionId) -> bool {
        txn.number() > 0 && txn.number() < self.next_transaction
    }
}

/// Coordinator bookkeeping for a queued or in-progress transaction. Dropped
/// as soon as the transaction commits, aborts or is released.
pub(crate) struct TransactionRecord {
    pub(crate) info: TransactionInfo,
    pub(crate) connection: ConnectionId,
    /// Operations issued so far; the next one gets this index.
    pub(crate) issued: usize,
    /// Indices of operations that failed.
    pub(crate) failed: Vec<usize>,
    /// Schema before a version change began.
    pub(crate) snapshot: Option<DatabaseInfo>,
    /// Result of an abort forced by suspension.
    pub(crate) suspension_abort: Option<Result<()>>,
}

impl TransactionRecord {
    pub(crate) fn new(info: TransactionInfo, connection: ConnectionId) -> Self {
        Self {
            info,
            connection,
            issued: 0,
            failed: Vec::new(),
            snapshot: None,
            suspension_abort: None,
        }
    }

    pub(crate) fn next_slot(&mut self) -> usize {
        let slot = self.issued;
        self.issued += 1;
        slot
    }

    /// Whether a failed operation sits beyond the results the client handled.
    pub(crate) fn has_unhandled_failure(&self, handled_results: usize) -> bool {
        self.failed.iter().any(|&slot| slot >= handled_results)
    }
}
