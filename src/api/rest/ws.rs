use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::auth::{Identity, Role};
use crate::models::location::LiveLocation;
use crate::realtime::registry::Registration;
use crate::state::AppState;

pub async fn operator_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    upgrade(ws, state, Role::Operator)
}

pub async fn requester_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    upgrade(ws, state, Role::Requester)
}

fn upgrade(ws: WebSocketUpgrade, state: Arc<AppState>, role: Role) -> Response {
    let tasks = state.tasks.clone();
    ws.on_upgrade(move |socket| tasks.track_future(handle_socket(socket, state, role)))
}

/// First frame a client must send.
#[derive(Debug, Deserialize)]
pub struct AuthFrame {
    pub token: String,
    #[serde(default)]
    pub party_id: Option<String>,
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, role: Role) {
    let identity = match authenticate(&mut socket, &state, role).await {
        Ok(identity) => identity,
        Err(reason) => {
            warn!(%role, reason, "websocket authentication failed");
            let close = Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: Cow::Borrowed(reason),
            }));
            let _ = socket.send(close).await;
            return;
        }
    };

    let party_id = identity.party_id.clone();
    let Registration {
        conn_id,
        mut outbound,
    } = state.registry.register(role, &party_id);
    update_gauge(&state, role);
    info!(party_id = %party_id, %role, %conn_id, "live channel opened");

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize outbound frame");
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let inbound_state = state.clone();
    let inbound_party = party_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) if role == Role::Operator => {
                    relay_position(&inbound_state, &inbound_party, &text).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
        _ = state.shutdown.cancelled() => {
            send_task.abort();
            recv_task.abort();
        }
    }

    // A reconnect may already own the entry; only the owner cleans up.
    if state.registry.unregister(role, &party_id, conn_id) && role == Role::Operator {
        state.router.operator_offline(&party_id).await;
    }
    update_gauge(&state, role);
    info!(party_id = %party_id, %role, %conn_id, "live channel closed");
}

async fn authenticate(
    socket: &mut WebSocket,
    state: &AppState,
    role: Role,
) -> Result<Identity, &'static str> {
    let first = tokio::time::timeout(state.settings.auth_frame_timeout, socket.recv())
        .await
        .map_err(|_| "authentication timed out")?;

    let text = match first {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(_)) => return Err("first frame must be a text auth frame"),
        Some(Err(_)) | None => return Err("connection closed before authentication"),
    };

    let frame: AuthFrame = serde_json::from_str(&text).map_err(|_| "malformed auth frame")?;
    let identity = state
        .authenticator
        .authenticate(&frame.token)
        .map_err(|_| "invalid token")?;
    identity.require(role).map_err(|_| "wrong role for this channel")?;

    if frame
        .party_id
        .as_deref()
        .is_some_and(|claimed| claimed != identity.party_id)
    {
        return Err("party id does not match token");
    }

    Ok(identity)
}

async fn relay_position(state: &AppState, operator_id: &str, text: &str) {
    let mut location: LiveLocation = match serde_json::from_str(text) {
        Ok(location) => location,
        Err(err) => {
            debug!(operator_id, error = %err, "ignoring malformed location frame");
            return;
        }
    };

    if let Err(err) = location.location.validate() {
        warn!(operator_id, error = %err, "ignoring out-of-range location");
        return;
    }

    location.operator_id = operator_id.to_string();
    state.router.relay_location(location).await;
}

fn update_gauge(state: &AppState, role: Role) {
    state
        .metrics
        .live_connections
        .with_label_values(&[&role.to_string()])
        .set(state.registry.connected(role) as i64);
}
