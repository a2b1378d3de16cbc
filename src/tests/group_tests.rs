//! Group lifecycle: creation seeds, membership algebra, the removal
//! cascade, renames and the reconcile repair pass

use crate::paths;
use crate::remote::Snapshot;
use crate::tests::{backend, engine};
use crate::Error;
use serde_json::json;

#[tokio::test]
async fn test_create_group_seeds_member_rows() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");

    let group = alice
        .create_group("Team", &["bob".to_string(), "carol".to_string()])
        .await
        .unwrap();

    let doc = remote
        .get(&paths::group_doc(&group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["memberIds"], json!(["alice", "bob", "carol"]));
    assert_eq!(doc["adminIds"], json!(["alice"]));
    assert_eq!(doc["lastMessage"], "Group created.");

    for member in ["alice", "bob", "carol"] {
        let row = remote
            .get(&paths::conversation_doc(member, &group.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["partnerName"], "Team");
        assert_eq!(row["isGroup"], true);
        assert_eq!(row["lastMessage"], "Group created.");
    }

    let local_row = alice.local().get_conversation(&group.id).unwrap().unwrap();
    assert!(local_row.is_group);
}

#[tokio::test]
async fn test_add_members_union_and_seed() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    let group = alice
        .create_group("Team", &["bob".to_string()])
        .await
        .unwrap();

    alice
        .add_group_members(&group.id, &["carol".to_string(), "bob".to_string()])
        .await
        .unwrap();

    let doc = remote
        .get(&paths::group_doc(&group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["memberIds"], json!(["alice", "bob", "carol"]));

    let carol_row = remote
        .get(&paths::conversation_doc("carol", &group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(carol_row["lastMessage"], "You were added.");
}

#[tokio::test]
async fn test_remove_member_cascade_until_group_deleted() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    let group = alice
        .create_group("Team", &["bob".to_string(), "carol".to_string()])
        .await
        .unwrap();

    alice.remove_group_member(&group.id, "bob").await.unwrap();
    let doc = remote
        .get(&paths::group_doc(&group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["memberIds"], json!(["alice", "carol"]));
    assert!(remote
        .get(&paths::conversation_doc("bob", &group.id))
        .await
        .unwrap()
        .is_none());

    alice.remove_group_member(&group.id, "carol").await.unwrap();
    let doc = remote
        .get(&paths::group_doc(&group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["memberIds"], json!(["alice"]));

    // The last member leaving drains the group and deletes its document.
    alice.leave_group(&group.id).await.unwrap();
    assert!(remote.get(&paths::group_doc(&group.id)).await.unwrap().is_none());
    assert!(alice.local().get_group(&group.id).unwrap().is_none());
    assert!(alice.local().get_conversation(&group.id).unwrap().is_none());
}

#[tokio::test]
async fn test_non_admin_cannot_remove_others_but_may_leave() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    let bob = engine(&remote, &status, "bob");
    let group = alice
        .create_group("Team", &["bob".to_string(), "carol".to_string()])
        .await
        .unwrap();

    let err = bob
        .remove_group_member(&group.id, "carol")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));

    bob.leave_group(&group.id).await.unwrap();
    let doc = remote
        .get(&paths::group_doc(&group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["memberIds"], json!(["alice", "carol"]));
}

#[tokio::test]
async fn test_group_message_fans_out_previews_and_unread() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    let group = alice
        .create_group("Team", &["bob".to_string()])
        .await
        .unwrap();

    let msg = alice.send_group_message(&group.id, "hello all").await.unwrap();

    let doc = remote
        .get(&paths::group_message_doc(&group.id, &msg.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["body"], "hello all");

    let alice_row = remote
        .get(&paths::conversation_doc("alice", &group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alice_row["lastMessage"], "You: hello all");
    assert_eq!(alice_row["unreadCount"], 0);

    let bob_row = remote
        .get(&paths::conversation_doc("bob", &group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bob_row["lastMessage"], "hello all");
    assert_eq!(bob_row["unreadCount"], 1);
}

#[tokio::test]
async fn test_group_delete_for_everyone_leaves_a_tombstone() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    let group = alice
        .create_group("Team", &["bob".to_string()])
        .await
        .unwrap();
    let victim = alice.send_group_message(&group.id, "secret").await.unwrap();

    alice
        .delete_group_message_for_everyone(&group.id, &victim.id)
        .await
        .unwrap();

    let doc = remote
        .get(&paths::group_message_doc(&group.id, &victim.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["body"], crate::store::TOMBSTONE_BODY);
    assert_eq!(doc["wasDeleted"], true);
    assert_eq!(doc["sentAt"], json!(victim.sent_at));

    // The victim was the newest message, so every member's preview and the
    // group document re-point at the marker.
    let group_doc = remote
        .get(&paths::group_doc(&group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group_doc["lastMessage"], crate::store::TOMBSTONE_BODY);
    for member in ["alice", "bob"] {
        let row = remote
            .get(&paths::conversation_doc(member, &group.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["lastMessage"], crate::store::TOMBSTONE_BODY);
    }

    // Non-authors are rejected.
    let bob = engine(&remote, &status, "bob");
    let group_snap = Snapshot {
        prefix: paths::groups_prefix(),
        docs: remote.list(&paths::groups_prefix()).await.unwrap(),
    };
    bob.apply_group_snapshot(&group_snap).unwrap();
    let msg_snap = Snapshot {
        prefix: paths::group_messages_prefix(&group.id),
        docs: remote
            .list(&paths::group_messages_prefix(&group.id))
            .await
            .unwrap(),
    };
    bob.apply_message_snapshot(&group.id, &msg_snap).unwrap();
    let err = bob
        .delete_group_message_for_everyone(&group.id, &victim.id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
}

#[tokio::test]
async fn test_group_delete_for_me_hides_only_for_the_owner() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    let bob = engine(&remote, &status, "bob");
    let group = alice
        .create_group("Team", &["bob".to_string()])
        .await
        .unwrap();
    let hidden = alice.send_group_message(&group.id, "awkward").await.unwrap();
    alice.send_group_message(&group.id, "hello").await.unwrap();

    let msg_snap = Snapshot {
        prefix: paths::group_messages_prefix(&group.id),
        docs: remote
            .list(&paths::group_messages_prefix(&group.id))
            .await
            .unwrap(),
    };
    bob.apply_message_snapshot(&group.id, &msg_snap).unwrap();

    alice
        .delete_group_message_for_me(&group.id, &hidden.id)
        .await
        .unwrap();

    let alice_timeline = crate::view::timeline(
        &alice.local().messages_for_thread(&group.id).unwrap(),
        &alice.local().deleted_messages(&group.id).unwrap(),
        "",
    );
    assert_eq!(alice_timeline.len(), 1);
    assert_eq!(alice_timeline[0].body, "hello");

    let bob_timeline = crate::view::timeline(
        &bob.local().messages_for_thread(&group.id).unwrap(),
        &bob.local().deleted_messages(&group.id).unwrap(),
        "",
    );
    assert_eq!(bob_timeline.len(), 2);

    // The overlay doc is keyed by the group id.
    let overlay = remote
        .get(&paths::deleted_messages_doc("alice", &group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(overlay["messageIds"], json!([hidden.id]));

    // The shared row is untouched.
    let doc = remote
        .get(&paths::group_message_doc(&group.id, &hidden.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["body"], "awkward");
}

#[tokio::test]
async fn test_group_read_ack_records_reader() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    let bob = engine(&remote, &status, "bob");
    let group = alice
        .create_group("Team", &["bob".to_string()])
        .await
        .unwrap();
    let msg = alice.send_group_message(&group.id, "hello").await.unwrap();

    let snap = Snapshot {
        prefix: paths::group_messages_prefix(&group.id),
        docs: remote
            .list(&paths::group_messages_prefix(&group.id))
            .await
            .unwrap(),
    };
    bob.apply_message_snapshot(&group.id, &snap).unwrap();
    bob.mark_group_read(&group.id).await.unwrap();

    let doc = remote
        .get(&paths::group_message_doc(&group.id, &msg.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["readBy"], json!(["bob"]));
}

#[tokio::test]
async fn test_rename_requires_admin_and_propagates() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    let group = alice
        .create_group("Team", &["bob".to_string()])
        .await
        .unwrap();

    let err = alice.rename_group(&group.id, "").await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));

    alice.rename_group(&group.id, "Crew").await.unwrap();
    let doc = remote
        .get(&paths::group_doc(&group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["name"], "Crew");
    for member in ["alice", "bob"] {
        let row = remote
            .get(&paths::conversation_doc(member, &group.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["partnerName"], "Crew");
    }

    // Non-admin members cannot rename.
    let bob = engine(&remote, &status, "bob");
    let snap = Snapshot {
        prefix: paths::groups_prefix(),
        docs: remote.list(&paths::groups_prefix()).await.unwrap(),
    };
    bob.apply_group_snapshot(&snap).unwrap();
    let err = bob.rename_group(&group.id, "Mine").await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
}

#[tokio::test]
async fn test_reconcile_repairs_missing_member_rows() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    let group = alice
        .create_group("Team", &["bob".to_string()])
        .await
        .unwrap();

    // Simulate a fan-out that never reached bob.
    remote
        .write(
            &paths::conversation_doc("bob", &group.id),
            crate::remote::WriteKind::Delete,
        )
        .await
        .unwrap();

    alice.reconcile_group(&group.id).await.unwrap();
    let row = remote
        .get(&paths::conversation_doc("bob", &group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["partnerName"], "Team");
    assert_eq!(row["isGroup"], true);
}

#[tokio::test]
async fn test_membership_snapshot_cascades_local_deletion() {
    let (remote, status) = backend();
    let alice = engine(&remote, &status, "alice");
    let bob = engine(&remote, &status, "bob");
    let group = alice
        .create_group("Team", &["bob".to_string()])
        .await
        .unwrap();

    let snap = Snapshot {
        prefix: paths::groups_prefix(),
        docs: remote.list(&paths::groups_prefix()).await.unwrap(),
    };
    bob.apply_group_snapshot(&snap).unwrap();
    let row = Snapshot {
        prefix: paths::conversations_prefix("bob"),
        docs: remote
            .list(&paths::conversations_prefix("bob"))
            .await
            .unwrap(),
    };
    bob.apply_conversation_snapshot(&row).unwrap();
    assert!(bob.local().get_group(&group.id).unwrap().is_some());

    alice.remove_group_member(&group.id, "bob").await.unwrap();
    let snap = Snapshot {
        prefix: paths::groups_prefix(),
        docs: remote.list(&paths::groups_prefix()).await.unwrap(),
    };
    bob.apply_group_snapshot(&snap).unwrap();

    assert!(bob.local().get_group(&group.id).unwrap().is_none());
    assert!(bob.local().get_conversation(&group.id).unwrap().is_none());
}
