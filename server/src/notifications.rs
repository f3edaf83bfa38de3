//! Channel subscriptions and state-change fan-out.
//!
//! The [`NotificationManager`] maps channel names to the set of connections
//! subscribed to them and turns each [`StateChangeEvent`] coming out of the
//! conversation store into a `conversation_state_change` message for every
//! subscriber.
//!
//! Delivery is best-effort and at-most-once. A subscriber whose connection
//! is gone is torn down (all of its subscriptions and its hub entry) the
//! first time a delivery to it fails; one whose queue is merely full loses
//! that event and stays subscribed.
//!
//! # Channels
//!
//! - `conversations`: every state change
//! - `conversation:<id>`: state changes of a single conversation
//!
//! # Example
//!
//! ```rust
//! use chatpulse_server::hub::ConnectionHub;
//! use chatpulse_server::notifications::NotificationManager;
//!
//! let hub = ConnectionHub::new();
//! let manager = NotificationManager::new(hub.clone());
//!
//! let (id, _rx) = hub.connect();
//! manager.subscribe("conversations", id).unwrap();
//! assert_eq!(manager.subscriber_count("conversations"), 1);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use chatpulse_monitor::store::StateChangeSink;
use chatpulse_monitor::types::StateChangeEvent;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::hub::{ConnectionHub, DeliveryFailure};
use crate::types::{
    conversation_channel, is_valid_channel, ConnectionId, ServerMessage,
    ALL_CONVERSATIONS_CHANNEL,
};

/// Errors returned by subscription management.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("unknown channel: {0}")]
    InvalidChannel(String),

    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// One connection's interest in one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub connection_id: ConnectionId,
    pub channel: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers the event was queued for.
    pub delivered: usize,
    /// Subscribers that missed the event but remain subscribed.
    pub dropped: usize,
    /// Subscribers torn down because their connection is gone.
    pub removed: usize,
}

/// Channel registry and event fan-out.
#[derive(Debug)]
pub struct NotificationManager {
    hub: ConnectionHub,
    channels: RwLock<HashMap<String, HashMap<ConnectionId, Subscription>>>,
}

impl NotificationManager {
    #[must_use]
    pub fn new(hub: ConnectionHub) -> Self {
        Self {
            hub,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// The hub this manager delivers through.
    #[must_use]
    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    /// Subscribes a connection to a channel.
    ///
    /// Returns `true` if the subscription is new and `false` if it already
    /// existed.
    ///
    /// # Errors
    ///
    /// Fails for channel names outside the supported set and for
    /// connections the hub does not know.
    pub fn subscribe(&self, channel: &str, id: ConnectionId) -> Result<bool, SubscriptionError> {
        if !is_valid_channel(channel) {
            return Err(SubscriptionError::InvalidChannel(channel.to_string()));
        }
        if !self.hub.is_connected(id) {
            return Err(SubscriptionError::UnknownConnection(id));
        }

        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let subscribers = channels.entry(channel.to_string()).or_default();
        if subscribers.contains_key(&id) {
            return Ok(false);
        }

        subscribers.insert(
            id,
            Subscription {
                connection_id: id,
                channel: channel.to_string(),
                created_at: Utc::now(),
            },
        );
        debug!(connection_id = %id, channel, "Subscribed");
        Ok(true)
    }

    /// Removes one subscription. Returns `true` if it existed.
    pub fn unsubscribe(&self, channel: &str, id: ConnectionId) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);

        let Some(subscribers) = channels.get_mut(channel) else {
            return false;
        };
        let removed = subscribers.remove(&id).is_some();
        if subscribers.is_empty() {
            channels.remove(channel);
        }

        if removed {
            debug!(connection_id = %id, channel, "Unsubscribed");
        }
        removed
    }

    /// Removes every subscription held by a connection and returns how many
    /// there were.
    pub fn unsubscribe_all(&self, id: ConnectionId) -> usize {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);

        let mut removed = 0;
        channels.retain(|_, subscribers| {
            if subscribers.remove(&id).is_some() {
                removed += 1;
            }
            !subscribers.is_empty()
        });
        removed
    }

    /// Tears a connection down: drops its subscriptions and its hub entry.
    pub fn disconnect(&self, id: ConnectionId) {
        let subscriptions = self.unsubscribe_all(id);
        self.hub.disconnect(id);
        debug!(connection_id = %id, subscriptions, "Connection cleaned up");
    }

    /// Channels a connection is subscribed to, sorted.
    #[must_use]
    pub fn subscriptions_of(&self, id: ConnectionId) -> Vec<String> {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = channels
            .iter()
            .filter(|(_, subscribers)| subscribers.contains_key(&id))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, HashMap::len)
    }

    /// Publishes an event to every subscriber of one channel.
    pub fn publish(&self, channel: &str, event: &StateChangeEvent) -> PublishReport {
        self.publish_to(&[channel], event)
    }

    /// Publishes to the union of several channels' subscribers.
    ///
    /// A connection subscribed to more than one of the channels receives the
    /// event once.
    pub fn publish_to(&self, channels: &[&str], event: &StateChangeEvent) -> PublishReport {
        let recipients: BTreeSet<ConnectionId> = {
            let registry = self.channels.read().unwrap_or_else(PoisonError::into_inner);
            channels
                .iter()
                .filter_map(|name| registry.get(*name))
                .flat_map(HashMap::keys)
                .copied()
                .collect()
        };

        let mut report = PublishReport::default();
        if recipients.is_empty() {
            trace!(conversation_id = %event.conversation_id, "No subscribers for state change");
            return report;
        }

        let message = ServerMessage::ConversationStateChange(event.clone());
        let mut dead = Vec::new();

        for id in recipients {
            match self.hub.deliver(id, message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(failure @ DeliveryFailure::Full) => {
                    warn!(connection_id = %id, error = %failure, "Dropping state change for slow client");
                    report.dropped += 1;
                }
                Err(failure) => {
                    warn!(connection_id = %id, error = %failure, "Delivery failed, removing subscriber");
                    dead.push(id);
                }
            }
        }

        for id in dead {
            self.disconnect(id);
            report.removed += 1;
        }

        trace!(
            conversation_id = %event.conversation_id,
            delivered = report.delivered,
            dropped = report.dropped,
            removed = report.removed,
            "State change published"
        );
        report
    }
}

impl StateChangeSink for NotificationManager {
    fn emit(&self, event: &StateChangeEvent) {
        let channel = conversation_channel(&event.conversation_id);
        self.publish_to(&[ALL_CONVERSATIONS_CHANNEL, channel.as_str()], event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatpulse_monitor::types::{ChangeTrigger, ConversationState, StateChangeContext};
    use tokio::sync::mpsc;

    fn event(id: &str) -> StateChangeEvent {
        StateChangeEvent {
            conversation_id: id.to_string(),
            previous_state: Some(ConversationState::Idle),
            new_state: ConversationState::AssistantWorking,
            context: StateChangeContext {
                project_path: "app".to_string(),
                message_count: 1,
                last_message_role: None,
                trigger: ChangeTrigger::Ingest,
                rule: "user_message".to_string(),
            },
            timestamp: Utc::now(),
        }
    }

    fn connect(hub: &ConnectionHub) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (id, mut rx) = hub.connect();
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Connection { .. })));
        (id, rx)
    }

    fn received_state_change(rx: &mut mpsc::Receiver<ServerMessage>) -> Option<StateChangeEvent> {
        match rx.try_recv() {
            Ok(ServerMessage::ConversationStateChange(event)) => Some(event),
            _ => None,
        }
    }

    // =========================================================================
    // Subscription management
    // =========================================================================

    #[test]
    fn subscribe_is_idempotent() {
        let hub = ConnectionHub::new();
        let manager = NotificationManager::new(hub.clone());
        let (id, _rx) = connect(&hub);

        assert_eq!(manager.subscribe("conversations", id), Ok(true));
        assert_eq!(manager.subscribe("conversations", id), Ok(false));
        assert_eq!(manager.subscriber_count("conversations"), 1);
    }

    #[test]
    fn subscribe_rejects_unknown_channel() {
        let hub = ConnectionHub::new();
        let manager = NotificationManager::new(hub.clone());
        let (id, _rx) = connect(&hub);

        assert_eq!(
            manager.subscribe("everything", id),
            Err(SubscriptionError::InvalidChannel("everything".to_string()))
        );
    }

    #[test]
    fn subscribe_rejects_unregistered_connection() {
        let manager = NotificationManager::new(ConnectionHub::new());
        let stranger = ConnectionId::new();

        assert_eq!(
            manager.subscribe("conversations", stranger),
            Err(SubscriptionError::UnknownConnection(stranger))
        );
    }

    #[test]
    fn unsubscribe_removes_only_that_channel() {
        let hub = ConnectionHub::new();
        let manager = NotificationManager::new(hub.clone());
        let (id, _rx) = connect(&hub);

        manager.subscribe("conversations", id).unwrap();
        manager.subscribe("conversation:a", id).unwrap();

        assert!(manager.unsubscribe("conversations", id));
        assert!(!manager.unsubscribe("conversations", id));
        assert_eq!(manager.subscriptions_of(id), vec!["conversation:a".to_string()]);
    }

    #[test]
    fn disconnect_drops_all_subscriptions() {
        let hub = ConnectionHub::new();
        let manager = NotificationManager::new(hub.clone());
        let (id, _rx) = connect(&hub);

        manager.subscribe("conversations", id).unwrap();
        manager.subscribe("conversation:a", id).unwrap();
        manager.disconnect(id);

        assert!(manager.subscriptions_of(id).is_empty());
        assert_eq!(hub.connection_count(), 0);
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    #[test]
    fn publish_reaches_only_channel_subscribers() {
        let hub = ConnectionHub::new();
        let manager = NotificationManager::new(hub.clone());
        let (a, mut rx_a) = connect(&hub);
        let (_b, mut rx_b) = connect(&hub);

        manager.subscribe("conversations", a).unwrap();
        let report = manager.publish("conversations", &event("c1"));

        assert_eq!(report.delivered, 1);
        assert_eq!(received_state_change(&mut rx_a).unwrap().conversation_id, "c1");
        assert!(received_state_change(&mut rx_b).is_none());
    }

    #[test]
    fn broken_subscriber_is_isolated_and_removed() {
        let hub = ConnectionHub::new();
        let manager = NotificationManager::new(hub.clone());
        let (a, mut rx_a) = connect(&hub);
        let (b, mut rx_b) = connect(&hub);
        let (broken, rx_broken) = connect(&hub);

        for id in [a, b, broken] {
            manager.subscribe("conversations", id).unwrap();
        }
        drop(rx_broken);

        let report = manager.publish("conversations", &event("c1"));

        assert_eq!(report.delivered, 2);
        assert_eq!(report.removed, 1);
        assert!(received_state_change(&mut rx_a).is_some());
        assert!(received_state_change(&mut rx_b).is_some());
        assert_eq!(manager.subscriber_count("conversations"), 2);
        assert!(!hub.is_connected(broken));
    }

    #[test]
    fn slow_subscriber_misses_event_but_stays() {
        let hub = ConnectionHub::with_capacity(1);
        let manager = NotificationManager::new(hub.clone());
        let (id, _rx) = hub.connect();
        manager.subscribe("conversations", id).unwrap();

        // Queue still holds the unread acknowledgement.
        let report = manager.publish("conversations", &event("c1"));

        assert_eq!(report.dropped, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(manager.subscriber_count("conversations"), 1);
    }

    #[test]
    fn sink_fans_out_to_both_channels_once() {
        let hub = ConnectionHub::new();
        let manager = NotificationManager::new(hub.clone());
        let (both, mut rx_both) = connect(&hub);
        let (scoped, mut rx_scoped) = connect(&hub);
        let (other, mut rx_other) = connect(&hub);

        manager.subscribe("conversations", both).unwrap();
        manager.subscribe("conversation:c1", both).unwrap();
        manager.subscribe("conversation:c1", scoped).unwrap();
        manager.subscribe("conversation:c2", other).unwrap();

        manager.emit(&event("c1"));

        assert!(received_state_change(&mut rx_both).is_some());
        assert!(received_state_change(&mut rx_both).is_none(), "delivered once");
        assert!(received_state_change(&mut rx_scoped).is_some());
        assert!(received_state_change(&mut rx_other).is_none());
    }
}
