//! Messages accepted by the coordinator actor.

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::errors::CoordinatorError;
use crate::protocol::ClientEvent;

use super::session::SessionSnapshot;

/// Mailbox message for the coordinator actor. Request/reply variants carry a
/// oneshot sender; fire-and-forget variants do not.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// A parsed client event from a live connection.
    Client {
        connection_id: Uuid,
        event: ClientEvent,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    /// The connection's socket task exited. Cleanup is unconditional and
    /// never fails; the reply only signals that it finished.
    ConnectionClosed {
        connection_id: Uuid,
        reply: oneshot::Sender<()>,
    },
    /// Point-in-time view of one session.
    Snapshot {
        session_id: String,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    /// Coordinator-wide counters.
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
}

/// Coordinator-wide counters for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CoordinatorStatus {
    pub sessions: usize,
    pub bound_connections: usize,
}
