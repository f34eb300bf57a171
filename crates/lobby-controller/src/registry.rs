//! Connection registry.
//!
//! Tracks every live WebSocket connection and provides the outbound send
//! path. Each connection owns a bounded mpsc channel drained by its socket
//! writer task; sends are fire-and-forget so a slow client can never block
//! the coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::ServerEvent;

/// Outbound queue depth per connection. A client that falls this far behind
/// starts losing events and will be dropped by its own writer task.
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// A live connection as seen by the coordinator.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    sender: mpsc::Sender<ServerEvent>,
    close: CancellationToken,
    alive: AtomicBool,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    /// Connection identifier, also the `socketId`/`patientID` on the wire.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queues an event for delivery. Fire-and-forget: a full or closed
    /// outbound queue drops the event and logs, it never blocks the caller.
    pub fn send(&self, event: ServerEvent) {
        if !self.is_connected() {
            tracing::debug!(
                target: "lobby.registry",
                connection_id = %self.id,
                "dropping event for closed connection"
            );
            return;
        }
        if let Err(e) = self.sender.try_send(event) {
            tracing::warn!(
                target: "lobby.registry",
                connection_id = %self.id,
                error = %e,
                "outbound queue rejected event"
            );
        }
    }

    /// Asks the connection's writer task to close the socket. Any events
    /// already queued are delivered first.
    pub fn disconnect(&self) {
        self.close.cancel();
    }

    /// Token the writer task waits on for server-initiated closes.
    #[must_use]
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// True until the socket task exits or a close is requested.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.close.is_cancelled()
    }

    /// Marks the connection dead. Called by the socket task on exit.
    pub fn mark_closed(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Registry of live connections, shared between the server and coordinator.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection, returning its handle and the receiving
    /// end of its outbound queue for the socket writer task.
    pub fn register(&self) -> (Arc<ConnectionHandle>, mpsc::Receiver<ServerEvent>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let handle = Arc::new(ConnectionHandle {
            id: Uuid::new_v4(),
            sender,
            close: CancellationToken::new(),
            alive: AtomicBool::new(true),
            connected_at: Utc::now(),
        });
        self.connections.insert(handle.id, Arc::clone(&handle));
        tracing::debug!(
            target: "lobby.registry",
            connection_id = %handle.id,
            total = self.connections.len(),
            "connection registered"
        );
        (handle, receiver)
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|entry| Arc::clone(&entry))
    }

    /// Removes a connection after its socket task exits.
    pub fn remove(&self, id: Uuid) {
        if let Some((_, handle)) = self.connections.remove(&id) {
            handle.mark_closed();
            tracing::debug!(
                target: "lobby.registry",
                connection_id = %id,
                total = self.connections.len(),
                "connection removed"
            );
        }
    }

    /// Queues an event for a connection if it is still live.
    pub fn send_to(&self, id: Uuid, event: ServerEvent) {
        if let Some(handle) = self.get(id) {
            handle.send(event);
        }
    }

    /// True if the connection is registered and its socket is open.
    #[must_use]
    pub fn is_connected(&self, id: Uuid) -> bool {
        self.get(id).is_some_and(|handle| handle.is_connected())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_send() {
        let registry = ConnectionRegistry::new();
        let (handle, mut receiver) = registry.register();
        assert_eq!(registry.len(), 1);
        assert!(registry.is_connected(handle.id()));

        handle.send(ServerEvent::Pong { timestamp: 0 });
        let event = receiver.recv().await.unwrap();
        assert!(matches!(event, ServerEvent::Pong { .. }));
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection_is_noop() {
        let registry = ConnectionRegistry::new();
        // Must not panic or block.
        registry.send_to(
            Uuid::new_v4(),
            ServerEvent::Waiting {
                message: "Please wait in the lobby.".to_string(),
                patient_id: Uuid::new_v4(),
            },
        );
        assert!(!registry.is_connected(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_close_token() {
        let registry = ConnectionRegistry::new();
        let (handle, _receiver) = registry.register();
        let token = handle.close_token();
        assert!(!token.is_cancelled());

        handle.disconnect();
        assert!(token.is_cancelled());
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_remove_marks_closed() {
        let registry = ConnectionRegistry::new();
        let (handle, _receiver) = registry.register();
        let id = handle.id();

        registry.remove(id);
        assert!(registry.get(id).is_none());
        assert!(!handle.is_connected());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let registry = ConnectionRegistry::new();
        let (handle, _receiver) = registry.register();
        // Never read the receiver; pushing past capacity must not block.
        for _ in 0..(OUTBOUND_CHANNEL_CAPACITY + 8) {
            handle.send(ServerEvent::Pong { timestamp: 0 });
        }
    }
}
