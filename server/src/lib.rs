//! ChatPulse Server - live conversation state hub.
//!
//! This crate embeds the conversation monitor and exposes it to clients:
//! - Pushing state changes to WebSocket subscribers by channel
//! - Serving snapshot reads of the conversation store over HTTP
//!
//! # Architecture
//!
//! The monitor's store emits every state change into the
//! [`NotificationManager`](notifications::NotificationManager), which fans it
//! out through the [`ConnectionHub`](hub::ConnectionHub) to the connections
//! subscribed to the matching channel. Nothing is persisted; delivery is
//! best-effort.

pub mod config;
pub mod error;
pub mod hub;
pub mod notifications;
pub mod routes;
pub mod types;

pub use config::Config;
pub use error::ServerError;
pub use hub::{ConnectionHub, DeliveryFailure};
pub use notifications::{NotificationManager, PublishReport, Subscription, SubscriptionError};
pub use routes::{create_router, AppState};
pub use types::{ClientMessage, ConnectionId, ServerMessage};
