//! Remote collection layout and thread identity
//!
//! Every remote document lives under one of the collections below. Paths are
//! plain strings; a document is always a direct child of its collection, so
//! prefix listeners never see nested subcollections.
//!
//! Two distinct keys exist for 1:1 threads:
//! - the *partition id* (`owner` first) addresses that participant's copy of
//!   the message set - each side of a conversation owns one partition;
//! - the *thread id* (order-independent) is the canonical pairing key, used
//!   for local message rows and the delete-for-me overlay so that both
//!   participants compute the same identifier.

/// Path of a user profile document
pub fn user_doc(uid: &str) -> String {
    format!("users/{}", uid)
}

/// Prefix of the users collection
pub fn users_prefix() -> String {
    "users/".to_string()
}

/// Path of one of the owner's contact documents
pub fn contact_doc(owner: &str, uid: &str) -> String {
    format!("users/{}/contacts/{}", owner, uid)
}

/// Prefix of the owner's contacts collection
pub fn contacts_prefix(owner: &str) -> String {
    format!("users/{}/contacts/", owner)
}

/// Path of the owner's conversation row for a peer or group
pub fn conversation_doc(owner: &str, partner_id: &str) -> String {
    format!("users/{}/conversations/{}", owner, partner_id)
}

/// Prefix of the owner's conversations collection
pub fn conversations_prefix(owner: &str) -> String {
    format!("users/{}/conversations/", owner)
}

/// Path of one of the owner's blocked-user markers
pub fn blocked_doc(owner: &str, uid: &str) -> String {
    format!("users/{}/blockedUsers/{}", owner, uid)
}

/// Prefix of the owner's blocked-users collection
pub fn blocked_prefix(owner: &str) -> String {
    format!("users/{}/blockedUsers/", owner)
}

/// Path of the owner's delete-for-me overlay for a thread
pub fn deleted_messages_doc(owner: &str, thread_id: &str) -> String {
    format!("users/{}/deletedMessages/{}", owner, thread_id)
}

/// Prefix of the owner's delete-for-me overlay collection
pub fn deleted_messages_prefix(owner: &str) -> String {
    format!("users/{}/deletedMessages/", owner)
}

/// Path of a group document
pub fn group_doc(group_id: &str) -> String {
    format!("groups/{}", group_id)
}

/// Prefix of the groups collection
pub fn groups_prefix() -> String {
    "groups/".to_string()
}

/// Path of a message inside a 1:1 thread partition
pub fn chat_message_doc(partition_id: &str, message_id: &str) -> String {
    format!("chats/{}/messages/{}", partition_id, message_id)
}

/// Prefix of a 1:1 thread partition's message collection
pub fn chat_messages_prefix(partition_id: &str) -> String {
    format!("chats/{}/messages/", partition_id)
}

/// Path of a message inside a group thread
pub fn group_message_doc(group_id: &str, message_id: &str) -> String {
    format!("groups/{}/messages/{}", group_id, message_id)
}

/// Prefix of a group thread's message collection
pub fn group_messages_prefix(group_id: &str) -> String {
    format!("groups/{}/messages/", group_id)
}

/// Realtime key-value node carrying a user's presence record
pub fn status_node(uid: &str) -> String {
    format!("/status/{}", uid)
}

/// Partition id of `owner`'s copy of the 1:1 thread with `peer`
///
/// Owner-first concatenation: each participant addresses their own partition,
/// and a message is mirrored into both.
pub fn partition_id(owner: &str, peer: &str) -> String {
    format!("{}{}", owner, peer)
}

/// Canonical thread id for a 1:1 pairing
///
/// Order-independent, so either participant computes the same id.
pub fn thread_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}{}", a, b)
    } else {
        format!("{}{}", b, a)
    }
}

/// Last path segment of a document path (its id within the collection)
pub fn doc_id(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
