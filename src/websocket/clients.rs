use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::auth::Role;
use crate::protocol::Frame;

/// One item on a connection's outbound queue. Frames are delivered in
/// submission order; `Close` shuts the socket down after draining.
#[derive(Debug)]
pub enum Outbound {
    Frame(Vec<u8>),
    /// Transport ping issued by the router's liveness timer.
    Ping(Vec<u8>),
    /// Transport pong replying to a peer ping; payload is the resolved
    /// user id, truncated to the control-frame limit.
    Pong(Vec<u8>),
    Close,
}

/// The registered connection of one user: handshake key, device identity and
/// the outbound queue of its socket.
#[derive(Clone)]
pub struct ClientHandle {
    /// Handshake nonce distinguishing this socket from a later login by the
    /// same user.
    pub key: Uuid,
    pub device_id: String,
    pub role: Role,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl ClientHandle {
    pub fn new(
        key: Uuid,
        device_id: impl Into<String>,
        role: Role,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            key,
            device_id: device_id.into(),
            role,
            sender,
        }
    }

    /// Queue an encoded frame. Sends to a connection whose socket already
    /// died are silently dropped; delivery is best effort.
    pub fn send(&self, frame: &Frame) {
        let _ = self.sender.send(Outbound::Frame(frame.encode()));
    }

    pub fn send_raw(&self, item: Outbound) {
        let _ = self.sender.send(item);
    }

    pub fn close(&self) {
        let _ = self.sender.send(Outbound::Close);
    }
}

/// Tracks the single registered connection per user id.
///
/// Cheaply cloneable — all clones share the same underlying map via `Arc`.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<String, ClientHandle>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user_id`.
    ///
    /// A prior connection with a different handshake key is a duplicate
    /// login: it receives `LOGIN_DUPLICATED` and a close, and the new
    /// connection takes its place. Re-registering the same key is a no-op.
    pub async fn register(&self, user_id: &str, handle: ClientHandle) {
        let mut clients = self.clients.write().await;
        if let Some(existing) = clients.get(user_id) {
            if existing.key == handle.key {
                return;
            }
            tracing::info!(
                user_id,
                old_key = %existing.key,
                new_key = %handle.key,
                "Duplicate login; displacing previous connection"
            );
            existing.send(&Frame::login_duplicated(user_id));
            existing.close();
        }
        clients.insert(user_id.to_string(), handle);
    }

    /// Remove the connection for `user_id`, but only while `key` still names
    /// it: the late close of a displaced connection must not evict its
    /// replacement. Returns whether an entry was removed.
    pub async fn unregister(&self, user_id: &str, key: Uuid) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get(user_id) {
            Some(existing) if existing.key == key => {
                clients.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Deliver a frame to a user's connection, if resident on this instance.
    /// Returns `false` (and drops the frame) otherwise.
    pub async fn send_to_user(&self, user_id: &str, frame: &Frame) -> bool {
        let clients = self.clients.read().await;
        match clients.get(user_id) {
            Some(handle) => {
                handle.send(frame);
                true
            }
            None => false,
        }
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        self.clients.read().await.contains_key(user_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Ask every registered connection to close. Used at shutdown so the
    /// accept loop can drain.
    pub async fn close_all(&self) {
        for handle in self.clients.read().await.values() {
            handle.close();
        }
    }
}

/// Broadcast set of dashboard sockets, keyed by handshake key so a single
/// user may watch from several dashboards at once.
#[derive(Clone, Default)]
pub struct DashboardSet {
    sockets: Arc<RwLock<HashMap<Uuid, mpsc::UnboundedSender<Outbound>>>>,
}

impl DashboardSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: Uuid, sender: mpsc::UnboundedSender<Outbound>) {
        self.sockets.write().await.insert(key, sender);
    }

    pub async fn remove(&self, key: Uuid) {
        self.sockets.write().await.remove(&key);
    }

    /// Send one frame to every dashboard socket. Closed sockets are skipped.
    pub async fn broadcast(&self, frame: &Frame) {
        let bytes = frame.encode();
        let sockets = self.sockets.read().await;
        for sender in sockets.values() {
            let _ = sender.send(Outbound::Frame(bytes.clone()));
        }
    }

    pub async fn len(&self) -> usize {
        self.sockets.read().await.len()
    }

    pub async fn close_all(&self) {
        for sender in self.sockets.read().await.values() {
            let _ = sender.send(Outbound::Close);
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChannelType, Frame, MSG_LOGIN_DUPLICATED, MSG_TEXT};
    use rmpv::Value;

    fn make_channel() -> (
        mpsc::UnboundedSender<Outbound>,
        mpsc::UnboundedReceiver<Outbound>,
    ) {
        mpsc::unbounded_channel()
    }

    fn handle(key: Uuid, tx: mpsc::UnboundedSender<Outbound>) -> ClientHandle {
        ClientHandle::new(key, "D1", Role::Mobile, tx)
    }

    fn text_frame(to: &str) -> Frame {
        Frame::new(ChannelType::Private, MSG_TEXT, "from", to, Value::from("hi"))
    }

    fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Frame {
        match rx.try_recv().expect("expected an outbound item") {
            Outbound::Frame(bytes) => Frame::decode(&bytes).expect("frame should decode"),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_and_send_delivers_frame() {
        let registry = ClientRegistry::new();
        let (tx, mut rx) = make_channel();
        registry.register("alice", handle(Uuid::new_v4(), tx)).await;

        assert!(registry.send_to_user("alice", &text_frame("alice")).await);
        assert_eq!(recv_frame(&mut rx).to, "alice");
    }

    #[tokio::test]
    async fn send_to_absent_user_reports_drop() {
        let registry = ClientRegistry::new();
        assert!(!registry.send_to_user("nobody", &text_frame("nobody")).await);
    }

    #[tokio::test]
    async fn duplicate_login_displaces_old_connection() {
        let registry = ClientRegistry::new();
        let (tx_old, mut rx_old) = make_channel();
        let (tx_new, mut rx_new) = make_channel();
        let key_old = Uuid::new_v4();
        let key_new = Uuid::new_v4();

        registry.register("alice", handle(key_old, tx_old)).await;
        registry.register("alice", handle(key_new, tx_new)).await;

        // Old connection got LOGIN_DUPLICATED, then a close.
        let displaced = recv_frame(&mut rx_old);
        assert_eq!(displaced.message_type, MSG_LOGIN_DUPLICATED);
        assert!(matches!(rx_old.try_recv(), Ok(Outbound::Close)));

        // Exactly the new connection is reachable.
        assert!(registry.send_to_user("alice", &text_frame("alice")).await);
        recv_frame(&mut rx_new);
        assert!(rx_old.try_recv().is_err());
        assert_eq!(registry.connected_count().await, 1);
    }

    #[tokio::test]
    async fn re_registration_with_same_key_is_idempotent() {
        let registry = ClientRegistry::new();
        let (tx, mut rx) = make_channel();
        let key = Uuid::new_v4();

        registry.register("alice", handle(key, tx.clone())).await;
        registry.register("alice", handle(key, tx)).await;

        // No LOGIN_DUPLICATED, no close.
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.connected_count().await, 1);
    }

    #[tokio::test]
    async fn unregister_requires_matching_key() {
        let registry = ClientRegistry::new();
        let (tx_old, _rx_old) = make_channel();
        let (tx_new, _rx_new) = make_channel();
        let key_old = Uuid::new_v4();
        let key_new = Uuid::new_v4();

        registry.register("alice", handle(key_old, tx_old)).await;
        registry.register("alice", handle(key_new, tx_new)).await;

        // The displaced connection's late close must not evict the new one.
        assert!(!registry.unregister("alice", key_old).await);
        assert!(registry.is_connected("alice").await);

        assert!(registry.unregister("alice", key_new).await);
        assert!(!registry.is_connected("alice").await);
    }

    #[tokio::test]
    async fn dashboard_broadcast_reaches_all_sockets() {
        let dashboards = DashboardSet::new();
        let (tx1, mut rx1) = make_channel();
        let (tx2, mut rx2) = make_channel();

        dashboards.add(Uuid::new_v4(), tx1).await;
        dashboards.add(Uuid::new_v4(), tx2).await;
        dashboards.broadcast(&text_frame("broadcast")).await;

        assert_eq!(recv_frame(&mut rx1).to, "broadcast");
        assert_eq!(recv_frame(&mut rx2).to, "broadcast");
    }

    #[tokio::test]
    async fn dashboard_remove_stops_delivery() {
        let dashboards = DashboardSet::new();
        let (tx, mut rx) = make_channel();
        let key = Uuid::new_v4();

        dashboards.add(key, tx).await;
        dashboards.remove(key).await;
        dashboards.broadcast(&text_frame("broadcast")).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(dashboards.len().await, 0);
    }
}
