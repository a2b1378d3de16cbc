//! Conversation list rows
//!
//! One row per (owner, peer-or-group). The row is a peer-specific projection,
//! not shared state: the same thread produces a different row for each
//! participant (their own unread count, their own "You: " prefix on the last
//! message, their own pin view until fan-out converges).

use serde::{Deserialize, Serialize};

/// A per-owner conversation row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Conversation {
    /// Peer uid for 1:1 threads, group id for groups
    pub partner_id: String,
    /// Display name of the peer or group as last asserted by the backend
    pub partner_name: String,
    /// Avatar URL of the peer or group
    pub partner_avatar_url: Option<String>,
    /// Preview of the most recent message
    pub last_message: String,
    /// Server timestamp (ms) of the most recent message
    pub last_message_at: i64,
    /// Peer phone number; empty for groups
    pub partner_phone: String,
    /// Messages delivered while this thread was not open
    pub unread_count: i64,
    /// Whether the partner is a group
    pub is_group: bool,
    /// Pinned message id, if any; must reference a message in this thread
    pub pinned_message_id: Option<String>,
}

impl Conversation {
    /// Create a 1:1 conversation row
    pub fn with_peer(partner_id: impl Into<String>, partner_name: impl Into<String>) -> Self {
        Self {
            partner_id: partner_id.into(),
            partner_name: partner_name.into(),
            ..Default::default()
        }
    }

    /// Create a group conversation row
    pub fn with_group(group_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            partner_id: group_id.into(),
            partner_name: name.into(),
            is_group: true,
            ..Default::default()
        }
    }

    /// Whether the row should surface in the "Unread" filter
    pub fn is_unread(&self) -> bool {
        self.unread_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_defaults() {
        let conv = Conversation::with_peer("u2", "Bob");
        assert!(!conv.is_group);
        assert!(!conv.is_unread());
        assert_eq!(conv.unread_count, 0);
        assert!(conv.pinned_message_id.is_none());
    }

    #[test]
    fn test_conversation_from_merge_doc() {
        // Receiver rows are created by merge writes and may carry only a
        // subset of fields.
        let conv: Conversation =
            serde_json::from_str(r#"{"partnerId":"u1","lastMessage":"hi","unreadCount":3}"#)
                .unwrap();
        assert_eq!(conv.partner_id, "u1");
        assert_eq!(conv.unread_count, 3);
        assert!(conv.is_unread());
        assert_eq!(conv.partner_phone, "");
    }
}
