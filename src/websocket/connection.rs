use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::clients::Outbound;
use crate::auth::Role;
use crate::protocol::Frame;
use crate::state::AppState;

/// Control-frame payloads are capped at 125 bytes by the transport.
const PONG_PAYLOAD_LIMIT: usize = 125;

/// Identity attached to one accepted socket for its whole lifetime.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub user_id: String,
    pub device_id: String,
    pub role: Role,
    /// Handshake nonce; distinguishes this socket from a later login by the
    /// same user.
    pub key: Uuid,
}

/// The pong payload sent in reply to a peer ping: the resolved user id,
/// truncated on a character boundary to the control-frame limit.
pub fn pong_payload(user_id: &str) -> Vec<u8> {
    let mut end = user_id.len().min(PONG_PAYLOAD_LIMIT);
    while end > 0 && !user_id.is_char_boundary(end) {
        end -= 1;
    }
    user_id.as_bytes()[..end].to_vec()
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Drive one accepted socket until it closes.
///
/// Owns four cooperating pieces: an outbound drain (frames in submission
/// order), a liveness ping ticker, an idle watchdog that releases the user's
/// speaker lock after a silent gap, and the inbound loop feeding the router.
/// Returns when either direction of the socket dies; the caller then runs
/// the disconnect path exactly once.
pub async fn run(
    socket: WebSocket,
    info: ConnectionInfo,
    state: AppState,
    tx: mpsc::UnboundedSender<Outbound>,
    rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let (ws_sender, ws_receiver) = socket.split();
    let last_activity = Arc::new(AtomicI64::new(now_millis()));

    let mut send_task = tokio::spawn(drain_outbound(ws_sender, rx));

    let ping_task = tokio::spawn(ping_loop(tx.clone(), state.config.ping_interval));

    // Only mobile connections hold speaker locks.
    let watchdog_task = (info.role == Role::Mobile).then(|| {
        tokio::spawn(idle_watchdog(
            info.user_id.clone(),
            state.clone(),
            last_activity.clone(),
        ))
    });

    let mut recv_task = tokio::spawn(recv_loop(
        ws_receiver,
        info.clone(),
        state.clone(),
        tx,
        last_activity,
    ));

    // Whichever side finishes first tears the other down.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    ping_task.abort();
    if let Some(watchdog) = watchdog_task {
        watchdog.abort();
    }
}

/// Forward queued outbound items to the socket, in order. `Close` drains the
/// queue: a displaced connection still receives its `LOGIN_DUPLICATED` frame
/// before the close frame goes out.
async fn drain_outbound(
    mut ws_sender: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        let message = match item {
            Outbound::Frame(bytes) => Message::Binary(bytes),
            Outbound::Ping(payload) => Message::Ping(payload),
            Outbound::Pong(payload) => Message::Pong(payload),
            Outbound::Close => {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        };
        if ws_sender.send(message).await.is_err() {
            break;
        }
    }
}

async fn ping_loop(tx: mpsc::UnboundedSender<Outbound>, period: std::time::Duration) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    loop {
        ticker.tick().await;
        if tx.send(Outbound::Ping(Vec::new())).is_err() {
            break;
        }
    }
}

/// Release the user's speaker lock after a silent gap longer than the idle
/// budget. The socket itself stays open; only transport-level ping/pong
/// failure closes it.
async fn idle_watchdog(user_id: String, state: AppState, last_activity: Arc<AtomicI64>) {
    let budget = state.config.max_idle_duration;
    let mut ticker = tokio::time::interval(budget);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it.
    ticker.tick().await;

    let mut cleared_at = 0i64;
    loop {
        ticker.tick().await;
        let seen = last_activity.load(Ordering::Relaxed);
        let idle = now_millis() - seen;
        if idle > budget.as_millis() as i64 && seen != cleared_at {
            tracing::debug!(
                user_id = %user_id,
                idle_ms = idle,
                "Idle gap exceeded; releasing speaker lock"
            );
            if let Err(e) = state.groups.clear_current_speaker_of(&user_id).await {
                tracing::warn!(user_id = %user_id, error = ?e, "Failed to release speaker lock on idle");
            }
            // One release per idle episode; new inbound activity re-arms.
            cleared_at = seen;
        }
    }
}

async fn recv_loop(
    mut ws_receiver: futures::stream::SplitStream<WebSocket>,
    info: ConnectionInfo,
    state: AppState,
    tx: mpsc::UnboundedSender<Outbound>,
    last_activity: Arc<AtomicI64>,
) {
    let touch = || last_activity.store(now_millis(), Ordering::Relaxed);

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Binary(bytes)) => {
                touch();
                match Frame::decode(&bytes) {
                    Ok(frame) => super::dispatch_frame(&state, &info, frame).await,
                    Err(e) => {
                        // A single malformed frame never disconnects the peer.
                        tracing::debug!(
                            user_id = %info.user_id,
                            error = %e,
                            "Dropping undecodable frame"
                        );
                    }
                }
            }
            Ok(Message::Ping(_)) => {
                touch();
                let _ = tx.send(Outbound::Pong(pong_payload(&info.user_id)));
            }
            Ok(Message::Pong(_)) => {
                touch();
                // The pong answers our liveness ping; for mobiles it also
                // extends the presence TTL.
                if info.role == Role::Mobile {
                    state.presence.refresh_heartbeat(&info.user_id).await;
                }
            }
            Ok(Message::Text(_)) => {
                touch();
                tracing::debug!(user_id = %info.user_id, "Ignoring text frame");
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(
                    user_id = %info.user_id,
                    error = ?e,
                    "Socket receive error; closing connection"
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_user_id_passes_through() {
        assert_eq!(pong_payload("alice"), b"alice".to_vec());
    }

    #[test]
    fn long_user_id_truncates_to_control_frame_limit() {
        let long = "x".repeat(300);
        let payload = pong_payload(&long);
        assert_eq!(payload.len(), 125);
        assert_eq!(payload, long.as_bytes()[..125].to_vec());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 63 two-byte characters: 126 bytes, one over the limit.
        let id = "é".repeat(63);
        let payload = pong_payload(&id);
        assert_eq!(payload.len(), 124);
        assert!(String::from_utf8(payload).is_ok());
    }

    #[test]
    fn empty_user_id_yields_empty_payload() {
        assert!(pong_payload("").is_empty());
    }
}
