//! Message rows, delivery state and tombstones
//!
//! A message row is created once and only ever patched afterwards (delivery
//! state, read set, soft deletion) - never physically removed. Deleting for
//! everyone replaces the body with [`TOMBSTONE_BODY`] while keeping the id
//! and timestamp stable so ordering and history survive.

use serde::{Deserialize, Serialize};

/// Body text a message is replaced with when deleted for everyone
pub const TOMBSTONE_BODY: &str = "This message was deleted";

/// Delivery state of a message from the sender's point of view
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    /// Written locally and to the remote partitions
    #[default]
    Sent,
    /// Known to have reached the recipient's device
    Delivered,
    /// Read by every other participant
    Read,
}

/// A message inside a thread
///
/// `thread_id` is the canonical thread key (order-independent for 1:1,
/// group id for groups). It is a local-only column: the remote copy of a
/// message is identical in both partitions and carries no partition name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    /// Globally unique message id, identical in both 1:1 partitions
    pub id: String,
    /// Canonical thread key; never serialized to the remote document
    #[serde(skip)]
    pub thread_id: String,
    /// Message body, or [`TOMBSTONE_BODY`] once deleted for everyone
    pub body: String,
    /// Uid of the author
    pub sender_id: String,
    /// Send timestamp in server milliseconds
    pub sent_at: i64,
    /// Delivery state
    pub delivery_state: DeliveryState,
    /// Uids that have read this message
    pub read_by: Vec<String>,
    /// Whether the body has been replaced by the tombstone marker
    pub was_deleted: bool,
    /// Attached media URL, if any
    pub media_url: Option<String>,
}

impl Message {
    /// Create a freshly sent message
    pub fn new(
        id: impl Into<String>,
        thread_id: impl Into<String>,
        body: impl Into<String>,
        sender_id: impl Into<String>,
        sent_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            body: body.into(),
            sender_id: sender_id.into(),
            sent_at,
            delivery_state: DeliveryState::Sent,
            read_by: Vec::new(),
            was_deleted: false,
            media_url: None,
        }
    }

    /// Whether the given uid is already in the read set
    pub fn is_read_by(&self, uid: &str) -> bool {
        self.read_by.iter().any(|r| r == uid)
    }

    /// Add a uid to the read set; returns false if it was already present
    pub fn mark_read_by(&mut self, uid: &str) -> bool {
        if self.is_read_by(uid) {
            return false;
        }
        self.read_by.push(uid.to_string());
        self.delivery_state = DeliveryState::Read;
        true
    }

    /// Replace the body with the tombstone marker, keeping id and timestamp
    pub fn tombstone(&mut self) {
        self.body = TOMBSTONE_BODY.to_string();
        self.was_deleted = true;
        self.media_url = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_state_wire_format() {
        assert_eq!(
            serde_json::to_string(&DeliveryState::Read).unwrap(),
            "\"READ\""
        );
        let state: DeliveryState = serde_json::from_str("\"SENT\"").unwrap();
        assert_eq!(state, DeliveryState::Sent);
    }

    #[test]
    fn test_thread_id_not_serialized() {
        let msg = Message::new("m1", "alicebob", "hi", "alice", 100);
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("threadId").is_none());
        assert_eq!(json["senderId"], "alice");
        assert_eq!(json["sentAt"], 100);
    }

    #[test]
    fn test_mark_read_by_idempotent() {
        let mut msg = Message::new("m1", "t1", "hi", "alice", 100);
        assert!(msg.mark_read_by("bob"));
        assert!(!msg.mark_read_by("bob"));
        assert_eq!(msg.read_by, vec!["bob"]);
        assert_eq!(msg.delivery_state, DeliveryState::Read);
    }

    #[test]
    fn test_tombstone_keeps_identity() {
        let mut msg = Message::new("m1", "t1", "secret", "alice", 100);
        msg.media_url = Some("http://blob".to_string());
        msg.tombstone();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.sent_at, 100);
        assert_eq!(msg.body, TOMBSTONE_BODY);
        assert!(msg.was_deleted);
        assert!(msg.media_url.is_none());
    }
}
