//! Session coordination.
//!
//! One actor owns every session; the rest of the process talks to it through
//! [`SessionCoordinatorHandle`], a cheap clone around the actor's mailbox.

mod actor;
mod messages;
pub mod metrics;
mod session;

pub use messages::CoordinatorStatus;
pub use session::SessionSnapshot;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::CoordinatorError;
use crate::protocol::ClientEvent;
use crate::registry::ConnectionRegistry;

use actor::SessionCoordinator;
use messages::CoordinatorMessage;

/// Mailbox depth for the coordinator. Events are tiny and handled fast, so
/// this only needs to absorb bursts.
const MAILBOX_CAPACITY: usize = 256;

/// Clonable handle to the coordinator actor.
#[derive(Debug, Clone)]
pub struct SessionCoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
}

impl SessionCoordinatorHandle {
    /// Spawns the coordinator actor, returning its handle and join handle.
    /// The actor stops when `shutdown` is cancelled or every handle is
    /// dropped.
    pub fn spawn(
        registry: Arc<ConnectionRegistry>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = SessionCoordinator::new(receiver, registry, shutdown);
        let join = tokio::spawn(actor.run());
        (Self { sender }, join)
    }

    /// Submits a client event and waits for the handler's verdict.
    ///
    /// # Errors
    ///
    /// Returns the handler's rejection, or
    /// [`CoordinatorError::Internal`] if the actor is gone.
    pub async fn dispatch(
        &self,
        connection_id: Uuid,
        event: ClientEvent,
    ) -> Result<(), CoordinatorError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Client {
                connection_id,
                event,
                reply,
            })
            .await
            .map_err(|_| CoordinatorError::Internal("coordinator unavailable".to_string()))?;
        response
            .await
            .map_err(|_| CoordinatorError::Internal("coordinator dropped request".to_string()))?
    }

    /// Reports a closed connection for cleanup. Waits until the cleanup has
    /// been applied; a missing actor means shutdown is in progress and the
    /// state is going away anyway.
    pub async fn connection_closed(&self, connection_id: Uuid) {
        let (reply, response) = oneshot::channel();
        if self
            .sender
            .send(CoordinatorMessage::ConnectionClosed {
                connection_id,
                reply,
            })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }

    /// Point-in-time view of one session, if it exists.
    pub async fn session_snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Snapshot {
                session_id: session_id.to_string(),
                reply,
            })
            .await
            .ok()?;
        response.await.ok().flatten()
    }

    /// Coordinator-wide counters.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Internal`] if the actor is gone.
    pub async fn status(&self) -> Result<CoordinatorStatus, CoordinatorError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Status { reply })
            .await
            .map_err(|_| CoordinatorError::Internal("coordinator unavailable".to_string()))?;
        response
            .await
            .map_err(|_| CoordinatorError::Internal("coordinator dropped request".to_string()))
    }
}
