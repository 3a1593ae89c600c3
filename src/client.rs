//! Event channel from a coordinator to its clients.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::error::DbError;
use crate::types::{ClientId, ConnectionId, RequestId, TransactionId};

/// Notification pushed from a coordinator to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Another request wants to upgrade or delete the database; the connection
    /// should close.
    VersionChange {
        /// Connection receiving the event.
        connection: ConnectionId,
        /// Request that caused the event.
        request: RequestId,
        /// Version currently in effect.
        old_version: u64,
        /// Requested version; `None` for a delete.
        new_version: Option<u64>,
    },
    /// The client's request is waiting on connections that have not closed.
    Blocked {
        /// Blocked request.
        request: RequestId,
        /// Version currently in effect.
        old_version: u64,
        /// Requested version; `None` for a delete.
        new_version: Option<u64>,
    },
    /// A transaction was activated in the backing store.
    TransactionStarted {
        /// Activated transaction.
        transaction: TransactionId,
        /// Error returned by the backing store when it could not begin.
        error: Option<DbError>,
    },
    /// The server closed the connection.
    ClosedByServer {
        /// Closed connection.
        connection: ConnectionId,
        /// Reason for the close.
        error: DbError,
    },
}

/// Server-side end of a client's event channel.
///
/// Requests whose link has been closed are discarded before they are
/// processed.
#[derive(Debug, Clone)]
pub struct ClientLink {
    id: ClientId,
    closed: Arc<AtomicBool>,
    events: UnboundedSender<ClientEvent>,
}

impl ClientLink {
    /// Creates a link and the receiver the client reads events from.
    pub fn new(id: ClientId) -> (Self, UnboundedReceiver<ClientEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let link = Self {
            id,
            closed: Arc::new(AtomicBool::new(false)),
            events,
        };
        (link, receiver)
    }

    /// Client identifier.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Marks the client as gone. Queued requests from it become stale.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the client has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.events.is_closed()
    }

    pub(crate) fn send(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            trace!(client = %self.id, "client event receiver dropped");
        }
    }
}
