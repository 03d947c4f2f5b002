pub mod clients;
pub mod connection;

pub use clients::{ClientHandle, ClientRegistry, DashboardSet, Outbound};
pub use connection::ConnectionInfo;

use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::AppError;
use crate::presence;
use crate::protocol::{
    ChannelType, Frame, MSG_AUDIO, MSG_CONNECTION, MSG_HEARTBEAT, MSG_REGISTER,
};
use crate::state::AppState;
use crate::store::keys;

/// Token resolution must finish inside this window or the handshake is
/// rejected.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

// ============================================================================
// Handshake
// ============================================================================

/// Credentials extracted from an upgrade request.
///
/// Headers take precedence (`token`/`voicepingtoken`, `device_id`/`deviceid`);
/// the websocket subprotocol list `[token, deviceId]` is the fallback for
/// clients that cannot set custom headers.
#[derive(Debug, Default, PartialEq)]
pub struct HandshakeParams {
    pub token: Option<String>,
    pub device_id: Option<String>,
}

impl HandshakeParams {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |names: &[&str]| {
            names.iter().find_map(|name| {
                headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
        };

        let mut params = HandshakeParams {
            token: header(&["token", "voicepingtoken"]),
            device_id: header(&["device_id", "deviceid"]),
        };

        if params.token.is_none() {
            if let Some(protocols) = header(&["sec-websocket-protocol"]) {
                let mut entries = protocols.split(',').map(str::trim).filter(|p| !p.is_empty());
                params.token = entries.next().map(str::to_string);
                if params.device_id.is_none() {
                    params.device_id = entries.next().map(str::to_string);
                }
            }
        }

        params
    }
}

/// GET /ws — authenticate and upgrade to a full-duplex connection.
///
/// The token is resolved before the upgrade is accepted; a missing or invalid
/// token, or a resolver that overruns its deadline, gets a plain 401 without
/// an upgrade attempt.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let params = HandshakeParams::from_headers(&headers);
    let Some(token) = params.token else {
        return (StatusCode::UNAUTHORIZED, "Missing token").into_response();
    };

    let resolved =
        match tokio::time::timeout(HANDSHAKE_DEADLINE, state.resolver.resolve(&token)).await {
            Ok(Ok(user)) => user,
            Ok(Err(_)) => {
                return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
            }
            Err(_) => {
                tracing::warn!("Token resolution exceeded handshake deadline");
                return (StatusCode::UNAUTHORIZED, "Token resolution timed out").into_response();
            }
        };

    let info = ConnectionInfo {
        user_id: resolved.user_id,
        device_id: params.device_id.unwrap_or_default(),
        role: resolved.role,
        key: Uuid::new_v4(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, info, state))
}

// ============================================================================
// Connection lifecycle
// ============================================================================

async fn handle_socket(socket: axum::extract::ws::WebSocket, info: ConnectionInfo, state: AppState) {
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();

    if info.role.is_dashboard() {
        // Snapshot first, then membership, so the dashboard's first frame is
        // the full picture and no update can arrive before it.
        match state.presence.snapshot().await {
            Ok(snapshot) => {
                let payload = serde_json::to_value(&snapshot).unwrap_or_default();
                let frame = Frame::presence_snapshot(&info.user_id, &payload);
                let _ = tx.send(Outbound::Frame(frame.encode()));
            }
            Err(e) => {
                tracing::warn!(user_id = %info.user_id, error = ?e, "Failed to build presence snapshot");
            }
        }
        state.dashboards.add(info.key, tx.clone()).await;
        tracing::info!(user_id = %info.user_id, role = info.role.as_str(), "Dashboard connected");
    } else {
        let handle = ClientHandle::new(info.key, &info.device_id, info.role, tx.clone());
        state.clients.register(&info.user_id, handle).await;
        let _ = tx.send(Outbound::Frame(Frame::connection_ack(&info.user_id).encode()));
        state
            .presence
            .set_user_online(&info.user_id, &info.device_id, info.role.as_str())
            .await;
        tracing::info!(
            user_id = %info.user_id,
            device_id = %info.device_id,
            "Client connected"
        );
    }

    connection::run(socket, info.clone(), state.clone(), tx, rx).await;

    // ── Disconnect path ──────────────────────────────────────────────────────
    if info.role.is_dashboard() {
        state.dashboards.remove(info.key).await;
        tracing::info!(user_id = %info.user_id, "Dashboard disconnected");
        return;
    }

    // A displaced connection's late close must not touch the state owned by
    // its replacement; only the registered connection cleans up.
    let was_registered = state.clients.unregister(&info.user_id, info.key).await;
    if was_registered {
        if let Err(e) = state.groups.clear_current_speaker_of(&info.user_id).await {
            tracing::warn!(user_id = %info.user_id, error = ?e, "Failed to release speaker locks on disconnect");
        }
        // Fast path: the peer is known gone, no need to wait for TTL expiry.
        state.presence.set_user_offline(&info.user_id).await;
        tracing::info!(user_id = %info.user_id, "Client disconnected");
    }
}

// ============================================================================
// Frame dispatch
// ============================================================================

/// Route one inbound frame. The sender identity is the connection's resolved
/// user id; the frame's `from` field is never trusted for routing decisions.
pub(crate) async fn dispatch_frame(state: &AppState, info: &ConnectionInfo, frame: Frame) {
    let sender = info.user_id.as_str();

    match frame.message_type {
        // Voluntary TTL refresh; not routed anywhere.
        MSG_HEARTBEAT => {
            state.presence.refresh_heartbeat(sender).await;
            return;
        }
        MSG_REGISTER => {
            tracing::info!(user_id = sender, "Device token registered");
            return;
        }
        _ => {}
    }

    match frame.channel {
        ChannelType::Private => {
            if !state.clients.send_to_user(&frame.to, &frame).await {
                // Recipient not resident on this instance: best-effort drop.
                tracing::debug!(to = %frame.to, "Recipient not connected; frame dropped");
            }
        }
        ChannelType::Group => {
            if frame.message_type == MSG_CONNECTION {
                // Device-token update smuggled over the group channel; a
                // side-effect, not a routable message.
                tracing::info!(user_id = sender, group = %frame.to, "Device token update");
                return;
            }
            if frame.message_type == MSG_AUDIO && !take_audio_turn(state, &frame.to, sender).await
            {
                return;
            }
            send_to_group(state, &frame.to, sender, &frame, false).await;
        }
    }
}

/// Acquire or keep the group's speaker lock for an inbound audio chunk.
/// Returns whether the chunk may be fanned out.
async fn take_audio_turn(state: &AppState, group_id: &str, sender: &str) -> bool {
    match state
        .groups
        .set_current_speaker(group_id, sender, state.config.group_busy_timeout)
        .await
    {
        Ok(lock) => {
            let elapsed = Utc::now().timestamp_millis() - lock.started_at;
            if elapsed > state.config.max_turn_duration.as_millis() as i64 {
                tracing::debug!(group_id, sender, "Turn exceeded maximum duration; releasing lock");
                if let Err(e) = state.groups.clear_current_speaker(group_id).await {
                    tracing::warn!(group_id, error = ?e, "Failed to release overlong speaker lock");
                }
            }
            true
        }
        Err(AppError::Busy) => {
            tracing::debug!(group_id, sender, "Channel busy; audio frame dropped");
            false
        }
        Err(e) => {
            // Transient store failure never blocks PTT delivery.
            tracing::warn!(group_id, sender, error = ?e, "Speaker lock unavailable; forwarding anyway");
            true
        }
    }
}

/// Resolve group membership and deliver the frame to every resident member.
/// A failed membership lookup produces an empty recipient set.
pub async fn send_to_group(
    state: &AppState,
    group_id: &str,
    sender: &str,
    frame: &Frame,
    echo: bool,
) {
    let members = match state.groups.members(group_id).await {
        Ok(members) => members,
        Err(e) => {
            tracing::warn!(group_id, error = ?e, "Failed to resolve group members; frame dropped");
            return;
        }
    };

    for recipient in group_recipients(&members, sender, echo) {
        state.clients.send_to_user(recipient, frame).await;
    }
}

/// Fan-out recipient set: every member except the sender, unless `echo`.
pub fn group_recipients<'a>(members: &'a [String], sender: &str, echo: bool) -> Vec<&'a str> {
    members
        .iter()
        .map(String::as_str)
        .filter(|member| echo || *member != sender)
        .collect()
}

// ============================================================================
// Presence bridge
// ============================================================================

/// Forward every presence transition received over the store's pub/sub to
/// the dashboard broadcast set as a `PRESENCE_UPDATE` frame.
///
/// Listens on the online/offline channels; `presence:updates` mirrors those
/// two and forwarding it as well would double every frame.
pub fn spawn_presence_bridge(state: AppState) -> JoinHandle<()> {
    let mut events = state.store.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event)
                    if event.channel == keys::CH_PRESENCE_ONLINE
                        || event.channel == keys::CH_PRESENCE_OFFLINE =>
                {
                    let Some(update) = presence::parse_update(&event.payload) else {
                        tracing::debug!(channel = %event.channel, "Skipping unparseable presence message");
                        continue;
                    };
                    let payload = serde_json::to_value(&update).unwrap_or_default();
                    state.dashboards.broadcast(&Frame::presence_update(&payload)).await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Presence bridge lagged behind store events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
