//! HTTP route handlers for the ChatPulse server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /ws` - WebSocket subscription endpoint for clients
//! - `GET /api/conversations` - Listing of every known conversation
//! - `GET /api/conversations/{*id}` - One conversation with its messages
//! - `GET /api/states` - Current state of every conversation
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - The notification manager (and through it the connection hub)
//! - A read handle on the conversation store
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chatpulse_monitor::ingest::MonitorHandle;
//! use chatpulse_server::config::Config;
//! use chatpulse_server::hub::ConnectionHub;
//! use chatpulse_server::notifications::NotificationManager;
//! use chatpulse_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let notifications = Arc::new(NotificationManager::new(ConnectionHub::new()));
//!     let monitor = MonitorHandle::start(&config.monitor, notifications.clone())
//!         .await
//!         .expect("failed to start monitor");
//!
//!     let state = AppState::new(config, notifications, monitor.reader());
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3333").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use chatpulse_monitor::store::StoreReader;
use chatpulse_monitor::types::{Conversation, ConversationOverview, ConversationState};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace};

use crate::config::Config;
use crate::error::ServerError;
use crate::notifications::NotificationManager;
use crate::types::{ClientMessage, ConnectionId, ServerMessage};

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Channel registry and fan-out for state changes.
    pub notifications: Arc<NotificationManager>,

    /// Read handle on the conversation store.
    pub store: StoreReader,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, notifications: Arc<NotificationManager>, store: StoreReader) -> Self {
        Self {
            config: Arc::new(config),
            notifications,
            store,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("port", &self.config.port)
            .field("notifications", &self.notifications)
            .field("store", &self.store)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(get_ws))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/{*id}", get(get_conversation))
        .route("/api/states", get(get_states))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// GET /ws - WebSocket Subscription
// ============================================================================

async fn get_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state.notifications))
}

/// Drives one client connection until it closes.
///
/// Outbound messages flow from the hub queue through a forwarding task;
/// inbound frames are control messages.
async fn handle_websocket(socket: WebSocket, notifications: Arc<NotificationManager>) {
    let (mut sender, mut receiver) = socket.split();
    let (connection_id, mut outbound) = notifications.hub().connect();

    info!(connection_id = %connection_id, "WebSocket client connected");

    let forward_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if let Err(err) = sender.send(Message::Text(json.into())).await {
                        debug!(connection_id = %connection_id, error = %err, "Failed to send to WebSocket client");
                        break;
                    }
                }
                Err(err) => {
                    error!(error = %err, "Failed to serialize server message");
                }
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let reply = handle_client_message(&notifications, connection_id, text.as_str());
                if let Err(failure) = notifications.hub().deliver(connection_id, reply) {
                    debug!(connection_id = %connection_id, error = %failure, "Control reply not delivered");
                    if failure.is_fatal() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                debug!(connection_id = %connection_id, "WebSocket client sent close frame");
                break;
            }
            Ok(Message::Ping(data)) => {
                trace!(data_len = data.len(), "Received ping");
            }
            Ok(_) => {}
            Err(err) => {
                debug!(connection_id = %connection_id, error = %err, "WebSocket error");
                break;
            }
        }
    }

    notifications.disconnect(connection_id);
    forward_task.abort();
    info!(connection_id = %connection_id, "WebSocket client disconnected");
}

/// Applies one control frame and returns the reply for the client.
pub(crate) fn handle_client_message(
    notifications: &NotificationManager,
    connection_id: ConnectionId,
    text: &str,
) -> ServerMessage {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(connection_id = %connection_id, error = %err, "Invalid control message");
            return ServerMessage::Error {
                message: format!("invalid message: {err}"),
            };
        }
    };

    match message {
        ClientMessage::Subscribe { channel } => {
            match notifications.subscribe(&channel, connection_id) {
                Ok(_) => ServerMessage::SubscriptionConfirmed { channel },
                Err(err) => ServerMessage::Error {
                    message: err.to_string(),
                },
            }
        }
        ClientMessage::Unsubscribe { channel } => {
            notifications.unsubscribe(&channel, connection_id);
            ServerMessage::UnsubscriptionConfirmed { channel }
        }
    }
}

// ============================================================================
// Read API
// ============================================================================

async fn list_conversations(State(state): State<AppState>) -> Json<Vec<ConversationOverview>> {
    Json(state.store.list())
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ServerError> {
    state
        .store
        .get(&id)
        .map(Json)
        .ok_or_else(|| ServerError::not_found(format!("conversation {id}")))
}

async fn get_states(State(state): State<AppState>) -> Json<BTreeMap<String, ConversationState>> {
    Json(state.store.states())
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Health check response body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,

    /// Live WebSocket connections.
    pub connections: usize,

    /// Conversations currently held by the store.
    pub conversations: usize,

    pub uptime_seconds: u64,
}

async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.notifications.hub().connection_count(),
        conversations: state.store.len(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
