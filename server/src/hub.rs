//! Connection registry for live WebSocket clients.
//!
//! Every accepted socket is registered with a fresh [`ConnectionId`] and a
//! bounded outbound queue. The socket task drains that queue into the
//! WebSocket sink; everything else writes into it with [`ConnectionHub::deliver`],
//! which never blocks.
//!
//! # Example
//!
//! ```rust
//! use chatpulse_server::hub::ConnectionHub;
//! use chatpulse_server::types::ServerMessage;
//!
//! let hub = ConnectionHub::new();
//! let (id, mut rx) = hub.connect();
//!
//! // The connection acknowledgement is queued first.
//! assert!(matches!(rx.try_recv(), Ok(ServerMessage::Connection { .. })));
//! assert_eq!(hub.connection_count(), 1);
//!
//! hub.disconnect(id);
//! assert_eq!(hub.connection_count(), 0);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::types::{ConnectionId, ServerMessage};

/// Outbound messages buffered per connection before deliveries are dropped.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Why a message could not be handed to a connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The socket task has gone away.
    #[error("connection closed")]
    Closed,

    #[error("unknown connection")]
    Unknown,

    /// The client is not draining its queue fast enough.
    #[error("outbound queue full")]
    Full,
}

impl DeliveryFailure {
    /// Returns `true` when the connection can never receive again.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Closed | Self::Unknown)
    }
}

#[derive(Debug)]
struct Connection {
    sender: mpsc::Sender<ServerMessage>,
    connected_at: DateTime<Utc>,
}

/// Registry of live connections and their outbound queues.
///
/// Cheap to clone; clones share the same registry.
#[derive(Debug, Clone)]
pub struct ConnectionHub {
    connections: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
    outbound_capacity: usize,
}

impl ConnectionHub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }

    /// Creates a hub whose per-connection queues hold `outbound_capacity` messages.
    #[must_use]
    pub fn with_capacity(outbound_capacity: usize) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    /// Registers a new connection.
    ///
    /// Returns its id and the receiving half of its outbound queue, with the
    /// `connection` acknowledgement already queued.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = ConnectionId::new();
        let (sender, receiver) = mpsc::channel(self.outbound_capacity);

        // Fresh channel with capacity >= 1; this cannot fail.
        let _ = sender.try_send(ServerMessage::Connection { client_id: id });

        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Connection {
                    sender,
                    connected_at: Utc::now(),
                },
            );

        debug!(connection_id = %id, "Connection registered");
        (id, receiver)
    }

    /// Queues a message for one connection without waiting.
    ///
    /// # Errors
    ///
    /// Returns a [`DeliveryFailure`] describing why the message was not queued.
    pub fn deliver(&self, id: ConnectionId, message: ServerMessage) -> Result<(), DeliveryFailure> {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let connection = connections.get(&id).ok_or(DeliveryFailure::Unknown)?;

        connection.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryFailure::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryFailure::Closed,
        })?;

        trace!(connection_id = %id, "Message queued");
        Ok(())
    }

    /// Forgets a connection. Returns `false` if it was not registered.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        if let Some(connection) = &removed {
            let lifetime = Utc::now() - connection.connected_at;
            debug!(
                connection_id = %id,
                lifetime_secs = lifetime.num_seconds(),
                "Connection removed"
            );
        }

        removed.is_some()
    }

    #[must_use]
    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_queues_acknowledgement() {
        let hub = ConnectionHub::new();
        let (id, mut rx) = hub.connect();

        match rx.try_recv() {
            Ok(ServerMessage::Connection { client_id }) => assert_eq!(client_id, id),
            other => panic!("expected connection ack, got {other:?}"),
        }
        assert!(hub.is_connected(id));
    }

    #[test]
    fn connection_ids_are_unique() {
        let hub = ConnectionHub::new();
        let (a, _rx_a) = hub.connect();
        let (b, _rx_b) = hub.connect();

        assert_ne!(a, b);
        assert_eq!(hub.connection_count(), 2);
    }

    #[test]
    fn deliver_reaches_receiver() {
        let hub = ConnectionHub::new();
        let (id, mut rx) = hub.connect();
        let _ = rx.try_recv();

        hub.deliver(
            id,
            ServerMessage::SubscriptionConfirmed {
                channel: "conversations".to_string(),
            },
        )
        .unwrap();

        assert!(matches!(
            rx.try_recv(),
            Ok(ServerMessage::SubscriptionConfirmed { .. })
        ));
    }

    #[test]
    fn deliver_to_dropped_receiver_is_closed() {
        let hub = ConnectionHub::new();
        let (id, rx) = hub.connect();
        drop(rx);

        let err = hub
            .deliver(id, ServerMessage::Error { message: "x".into() })
            .unwrap_err();
        assert_eq!(err, DeliveryFailure::Closed);
        assert!(err.is_fatal());
    }

    #[test]
    fn deliver_to_unknown_connection() {
        let hub = ConnectionHub::new();
        let err = hub
            .deliver(ConnectionId::new(), ServerMessage::Error { message: "x".into() })
            .unwrap_err();
        assert_eq!(err, DeliveryFailure::Unknown);
    }

    #[test]
    fn full_queue_is_not_fatal() {
        let hub = ConnectionHub::with_capacity(1);
        let (id, _rx) = hub.connect();

        // The acknowledgement already fills the single slot.
        let err = hub
            .deliver(id, ServerMessage::Error { message: "x".into() })
            .unwrap_err();
        assert_eq!(err, DeliveryFailure::Full);
        assert!(!err.is_fatal());
        assert!(hub.is_connected(id));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let hub = ConnectionHub::new();
        let (id, _rx) = hub.connect();

        assert!(hub.disconnect(id));
        assert!(!hub.disconnect(id));
        assert_eq!(hub.connection_count(), 0);
    }
}
