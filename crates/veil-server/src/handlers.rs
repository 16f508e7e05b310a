//! Connection handlers for the Veil relay server.
//!
//! This module handles the connection lifecycle, event processing, and the
//! HTTP read surface over the registry.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use veil_core::route_cache::SWEEP_INTERVAL;
use veil_core::{now_ms, ConnectionId, Relay, Switchboard};
use veil_protocol::{codec, ClientEvent};

/// Shared server state.
pub struct AppState {
    /// The relay engine.
    pub relay: Relay,
    /// Connection and channel bookkeeping.
    pub switchboard: Arc<Switchboard>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let switchboard = Arc::new(Switchboard::new());
        let relay = Relay::new(switchboard.clone(), config.privacy_mode);

        Self {
            relay,
            switchboard,
            config,
        }
    }
}

/// Build the HTTP/WebSocket application.
#[must_use]
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/users/online", get(users_online_handler))
        .route("/users/find", post(users_find_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    config.validate()?;
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    spawn_route_sweeper(state.clone());

    let app = build_app(state);
    let addr = config.bind_addr();

    if config.tls.enabled {
        let rustls =
            RustlsConfig::from_pem_file(&config.tls.cert_path, &config.tls.key_path).await?;
        info!("Veil relay listening on {} (TLS)", addr);
        axum_server::bind_rustls(addr, rustls)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = TcpListener::bind(addr).await?;
        info!("Veil relay listening on {}", addr);
        info!("WebSocket endpoint: ws://{}/ws", addr);
        axum::serve(listener, app).await?;
    }

    Ok(())
}

/// Periodically drop expired route-cache entries, off the event path.
pub fn spawn_route_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await; // first tick fires immediately
        loop {
            interval.tick().await;
            let removed = state.relay.routes().sweep();
            if removed > 0 {
                debug!(removed, "Route cache sweep");
            }
        }
    });
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "online",
        "users": state.relay.registry().len(),
        "timestamp": now_ms(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Online-users listing. Public keys are omitted under privacy mode.
async fn users_online_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let users = state
        .relay
        .registry()
        .snapshot(None, !state.config.privacy_mode);
    Json(serde_json::json!({ "users": users }))
}

#[derive(Debug, Deserialize)]
struct FindRequest {
    #[serde(rename = "publicKey")]
    public_key: String,
}

/// Reverse lookup by public key. Disabled entirely under privacy mode.
async fn users_find_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FindRequest>,
) -> impl IntoResponse {
    if state.config.privacy_mode {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "Lookup disabled" })),
        )
            .into_response();
    }

    match state.relay.registry().find_by_public_key(&req.public_key) {
        Some(user) => Json(serde_json::json!({
            "found": true,
            "user": {
                "id": user.id,
                "publicKey": user.public_key,
                "lastSeen": user.last_seen,
            }
        }))
        .into_response(),
        None => Json(serde_json::json!({ "found": false })).into_response(),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    debug!(connection = %connection_id, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Outbound events queued by the relay for this connection
    let mut outbound = state.switchboard.attach(connection_id.clone());

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Event processing loop
    'conn: loop {
        tokio::select! {
            biased;

            // Drain events the relay addressed to this connection
            Some(event) = outbound.recv() => {
                match codec::encode(&event) {
                    Ok(data) => {
                        metrics::record_event(data.len(), "outbound");
                        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "Failed to encode event");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        // Decode all complete frames
                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => {
                                    metrics::record_event(data.len(), "inbound");
                                    state.relay.handle_event(&connection_id, event);
                                }
                                Ok(None) => break,
                                Err(codec::ProtocolError::FrameTooLarge(size)) => {
                                    // Framing is unrecoverable past this point.
                                    warn!(connection = %connection_id, size, "Oversized frame, closing");
                                    metrics::record_error("frame_too_large");
                                    break 'conn;
                                }
                                Err(e) => {
                                    // Malformed event: drop it, no side effects.
                                    warn!(connection = %connection_id, error = %e, "Dropping malformed frame");
                                    metrics::record_error("malformed");
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(_))) => {
                        // Binary protocol only; ignore stray text frames.
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: drop presence first so the offline broadcast reaches the
    // remaining connections, then detach the queue.
    state.relay.handle_disconnect(&connection_id);
    state.switchboard.detach(&connection_id);
    metrics::set_active_users(state.relay.registry().len());

    debug!(connection = %connection_id, "WebSocket disconnected");
}
