//! Presence lifecycle against the shared backend clock

use crate::presence::{format_last_seen, PresenceChannel, PresenceState};
use crate::tests::backend;
use std::sync::Arc;

#[tokio::test]
async fn test_graceful_offline_then_disconnect_converges() {
    let (_, status) = backend();
    let mut channel = PresenceChannel::new(Arc::clone(&status), "alice");

    channel.go_online();
    channel.go_offline();
    let graceful_seen = status.get("alice").unwrap().last_seen;

    // The hook armed at go_online still fires on the later severance.
    channel.handle_disconnect();
    assert_eq!(channel.state(), PresenceState::Disconnected);

    let final_status = status.get("alice").unwrap();
    assert!(!final_status.online);
    assert!(final_status.last_seen > graceful_seen);
}

#[tokio::test]
async fn test_peer_observes_transitions_through_watch() {
    let (_, status) = backend();
    let mut rx = status.watch_status("alice");
    let mut channel = PresenceChannel::new(Arc::clone(&status), "alice");

    channel.go_online();
    rx.changed().await.unwrap();
    assert!(rx.borrow_and_update().unwrap().online);

    channel.go_offline();
    rx.changed().await.unwrap();
    let record = rx.borrow_and_update().unwrap();
    assert!(!record.online);
    assert!(!format_last_seen(record.last_seen, record.last_seen).is_empty());
}

#[tokio::test]
async fn test_backend_loss_marks_all_sessions_offline() {
    let (_, status) = backend();
    let mut alice = PresenceChannel::new(Arc::clone(&status), "alice");
    let mut bob = PresenceChannel::new(Arc::clone(&status), "bob");
    alice.go_online();
    bob.go_online();

    status.set_connected(false);

    assert!(!status.get("alice").unwrap().online);
    assert!(!status.get("bob").unwrap().online);
}
