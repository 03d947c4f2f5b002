mod common;

use common::text_frame;
use tokio::sync::mpsc;
use uuid::Uuid;

use talkback_server::auth::Role;
use talkback_server::protocol::{Frame, MSG_LOGIN_DUPLICATED};
use talkback_server::websocket::{group_recipients, ClientHandle, ClientRegistry, Outbound};

fn handle(key: Uuid) -> (ClientHandle, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ClientHandle::new(key, "D1", Role::Mobile, tx), rx)
}

fn drain_frames(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> (Vec<Frame>, bool) {
    let mut frames = Vec::new();
    let mut closed = false;
    while let Ok(item) = rx.try_recv() {
        match item {
            Outbound::Frame(bytes) => frames.push(Frame::decode(&bytes).expect("decode")),
            Outbound::Close => closed = true,
            _ => {}
        }
    }
    (frames, closed)
}

/// After two logins with distinct handshake keys, exactly the new connection
/// is reachable and exactly the old one saw LOGIN_DUPLICATED and a close.
#[tokio::test]
async fn duplicate_login_uniqueness() {
    let registry = ClientRegistry::new();
    let (old, mut old_rx) = handle(Uuid::new_v4());
    let (new, mut new_rx) = handle(Uuid::new_v4());

    registry.register("A", old).await;
    registry.register("A", new).await;

    let (old_frames, old_closed) = drain_frames(&mut old_rx);
    assert_eq!(old_frames.len(), 1);
    assert_eq!(old_frames[0].message_type, MSG_LOGIN_DUPLICATED);
    assert!(old_closed);

    assert!(registry.send_to_user("A", &text_frame("B", "A", "hi")).await);
    let (new_frames, new_closed) = drain_frames(&mut new_rx);
    assert_eq!(new_frames.len(), 1);
    assert!(!new_closed);

    // Nothing further reached the displaced connection.
    let (old_frames, _) = drain_frames(&mut old_rx);
    assert!(old_frames.is_empty());
}

#[tokio::test]
async fn displaced_connection_close_does_not_evict_replacement() {
    let registry = ClientRegistry::new();
    let old_key = Uuid::new_v4();
    let new_key = Uuid::new_v4();
    let (old, _old_rx) = handle(old_key);
    let (new, _new_rx) = handle(new_key);

    registry.register("A", old).await;
    registry.register("A", new).await;

    // The displaced socket's close event arrives late.
    assert!(!registry.unregister("A", old_key).await);
    assert!(registry.is_connected("A").await);

    assert!(registry.unregister("A", new_key).await);
    assert!(!registry.is_connected("A").await);
}

#[tokio::test]
async fn registry_tracks_one_client_per_user() {
    let registry = ClientRegistry::new();
    let (a, _a_rx) = handle(Uuid::new_v4());
    let (b, _b_rx) = handle(Uuid::new_v4());

    registry.register("A", a).await;
    registry.register("B", b).await;
    assert_eq!(registry.connected_count().await, 2);

    let (a2, _a2_rx) = handle(Uuid::new_v4());
    registry.register("A", a2).await;
    assert_eq!(registry.connected_count().await, 2);
}

// ── Fan-out exclusion ────────────────────────────────────────────────────────

#[test]
fn fan_out_never_delivers_to_sender_without_echo() {
    let members: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
    for sender in &members {
        let recipients = group_recipients(&members, sender, false);
        assert!(!recipients.contains(&sender.as_str()));
        assert_eq!(recipients.len(), members.len() - 1);
    }
}

#[test]
fn fan_out_with_echo_delivers_to_sender_once() {
    let members: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
    let recipients = group_recipients(&members, "A", true);
    assert_eq!(recipients.iter().filter(|r| **r == "A").count(), 1);
    assert_eq!(recipients.len(), 3);
}
