//! Contacts, blocking, pinning, profile propagation and the standing
//! subscription loop

use crate::paths;
use crate::remote::{to_document, WriteKind};
use crate::store::User;
use crate::tests::{backend, engine, wait_for};
use crate::view::{self, ChatFilter};
use crate::Error;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

async fn seed_user(remote: &crate::remote::RemoteStore, uid: &str, name: &str, phone: &str) {
    let user = User::new(uid, name, phone);
    remote
        .write(
            &paths::user_doc(uid),
            WriteKind::Set(to_document(&user).unwrap()),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_add_contact_by_phone_lookup() {
    let (remote, status) = backend();
    seed_user(&remote, "bob", "Robert", "+331").await;
    let alice = engine(&remote, &status, "alice");

    let contact = alice.add_contact("+331", "Bobby").await.unwrap();
    assert_eq!(contact.uid, "bob");
    assert_eq!(contact.custom_name, "Bobby");

    let doc = remote
        .get(&paths::contact_doc("alice", "bob"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["customName"], "Bobby");

    let row = alice.local().get_conversation("bob").unwrap().unwrap();
    assert_eq!(row.partner_name, "Bobby");
    assert_eq!(row.partner_phone, "+331");
}

#[tokio::test]
async fn test_add_contact_unknown_phone_and_self() {
    let (remote, status) = backend();
    seed_user(&remote, "alice", "Alice", "+330").await;
    let alice = engine(&remote, &status, "alice");

    let err = alice.add_contact("+999", "Ghost").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = alice.add_contact("+330", "Me").await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
}

#[tokio::test]
async fn test_delete_contact_removes_conversation() {
    let (remote, status) = backend();
    seed_user(&remote, "bob", "Robert", "+331").await;
    let alice = engine(&remote, &status, "alice");
    alice.add_contact("+331", "Bobby").await.unwrap();

    alice.delete_contact("bob").await.unwrap();
    assert!(remote
        .get(&paths::contact_doc("alice", "bob"))
        .await
        .unwrap()
        .is_none());
    assert!(remote
        .get(&paths::conversation_doc("alice", "bob"))
        .await
        .unwrap()
        .is_none());
    assert!(alice.local().get_contact("bob").unwrap().is_none());
    assert!(alice.local().get_conversation("bob").unwrap().is_none());
}

#[tokio::test]
async fn test_block_hides_conversation_until_unblock() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    alice.send_message("bob", "hi").await.unwrap();

    alice.block_user("bob").await.unwrap();
    let rows = alice.local().list_conversations().unwrap();
    let blocked = alice.local().blocked_users().unwrap();
    let visible = view::conversation_list(&rows, &[], &blocked, "", ChatFilter::All);
    assert!(visible.is_empty());

    alice.unblock_user("bob").await.unwrap();
    let blocked = alice.local().blocked_users().unwrap();
    let visible = view::conversation_list(&rows, &[], &blocked, "", ChatFilter::All);
    assert_eq!(visible.len(), 1);
}

#[tokio::test]
async fn test_blocked_snapshot_replaces_the_set() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    alice.block_user("bob").await.unwrap();
    alice.block_user("carol").await.unwrap();

    // The backend dropped carol's marker; the snapshot is authoritative.
    remote
        .write(&paths::blocked_doc("alice", "carol"), WriteKind::Delete)
        .await
        .unwrap();
    let snap = crate::remote::Snapshot {
        prefix: paths::blocked_prefix("alice"),
        docs: remote
            .list(&paths::blocked_prefix("alice"))
            .await
            .unwrap(),
    };
    alice.apply_blocked_snapshot(&snap).unwrap();

    let expected: HashSet<String> = ["bob".to_string()].into_iter().collect();
    assert_eq!(alice.local().blocked_users().unwrap(), expected);
}

#[tokio::test]
async fn test_pin_fans_out_and_validates() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    let msg = alice.send_message("bob", "pin me").await.unwrap();

    let err = alice.pin_message("bob", "no-such-id").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    alice.pin_message("bob", &msg.id).await.unwrap();
    for (owner, partner) in [("alice", "bob"), ("bob", "alice")] {
        let row = remote
            .get(&paths::conversation_doc(owner, partner))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["pinnedMessageId"], json!(msg.id));
    }
    let row = alice.local().get_conversation("bob").unwrap().unwrap();
    assert_eq!(row.pinned_message_id.as_deref(), Some(msg.id.as_str()));

    alice.unpin_message("bob").await.unwrap();
    let row = remote
        .get(&paths::conversation_doc("bob", "alice"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["pinnedMessageId"], json!(null));
}

#[tokio::test]
async fn test_display_name_propagates_to_pointing_rows() {
    let (remote, status) = backend();
    seed_user(&remote, "alice", "Alice", "+330").await;
    let alice = engine(&remote, &status, "alice");
    // Two conversations point at alice after she messages both peers.
    alice.send_message("bob", "hi").await.unwrap();
    alice.send_message("carol", "hi").await.unwrap();

    alice.set_display_name("Alicia").await.unwrap();

    let profile = remote
        .get(&paths::user_doc("alice"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile["name"], "Alicia");
    for owner in ["bob", "carol"] {
        let row = remote
            .get(&paths::conversation_doc(owner, "alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["partnerName"], "Alicia");
    }
}

#[tokio::test]
async fn test_push_token_upkeep() {
    let (remote, status) = backend();
    seed_user(&remote, "alice", "Alice", "+330").await;
    let alice = engine(&remote, &status, "alice");

    alice.set_push_token("token-1").await.unwrap();
    let profile = remote
        .get(&paths::user_doc("alice"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile["pushToken"], "token-1");
    // Other profile fields survive the merge.
    assert_eq!(profile["name"], "Alice");
}

#[tokio::test]
async fn test_start_keeps_local_rows_in_sync() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    let bob = engine(&remote, &status, "bob");
    let _handle = bob.start();

    alice.send_message("bob", "ping").await.unwrap();

    let bob_local = Arc::clone(bob.local());
    wait_for(move || {
        bob_local
            .get_conversation("alice")
            .map(|c| c.map(|c| c.unread_count == 1).unwrap_or(false))
            .unwrap_or(false)
    })
    .await;
}
