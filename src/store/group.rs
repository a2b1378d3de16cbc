//! Group documents
//!
//! Membership mutates through set algebra (union on add, difference on
//! remove) rather than whole-array overwrite, so concurrent edits from
//! different admins merge instead of clobbering each other. A group whose
//! member set drains to empty is deleted.

use serde::{Deserialize, Serialize};

/// A group document, shared by all members
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Group {
    /// Globally unique group id
    pub id: String,
    /// Group display name
    pub name: String,
    /// Member uids; ordered for display, set semantics for mutation
    pub member_ids: Vec<String>,
    /// Admin uids; always a subset of `member_ids`
    pub admin_ids: Vec<String>,
    /// Group avatar URL
    pub avatar_url: Option<String>,
    /// Preview of the most recent message
    pub last_message: String,
    /// Server timestamp (ms) of the most recent message
    pub last_message_at: i64,
}

impl Group {
    /// Create a group with an initial member set; the creator becomes admin
    pub fn new(id: impl Into<String>, name: impl Into<String>, creator: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            member_ids: vec![creator.to_string()],
            admin_ids: vec![creator.to_string()],
            ..Default::default()
        }
    }

    /// Whether the uid is currently a member
    pub fn is_member(&self, uid: &str) -> bool {
        self.member_ids.iter().any(|m| m == uid)
    }

    /// Whether the uid is currently an admin
    pub fn is_admin(&self, uid: &str) -> bool {
        self.admin_ids.iter().any(|a| a == uid)
    }

    /// Union new members into the member set, preserving order
    pub fn add_members(&mut self, uids: &[String]) {
        for uid in uids {
            if !self.is_member(uid) {
                self.member_ids.push(uid.clone());
            }
        }
    }

    /// Remove a member (and their admin role, if any)
    pub fn remove_member(&mut self, uid: &str) {
        self.member_ids.retain(|m| m != uid);
        self.admin_ids.retain(|a| a != uid);
    }

    /// A group with no members no longer exists
    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_creator_is_admin() {
        let group = Group::new("g1", "Team", "alice");
        assert!(group.is_member("alice"));
        assert!(group.is_admin("alice"));
    }

    #[test]
    fn test_add_members_is_union() {
        let mut group = Group::new("g1", "Team", "alice");
        group.add_members(&["bob".to_string(), "alice".to_string(), "bob".to_string()]);
        assert_eq!(group.member_ids, vec!["alice", "bob"]);
    }

    #[test]
    fn test_remove_member_strips_admin_role() {
        let mut group = Group::new("g1", "Team", "alice");
        group.add_members(&["bob".to_string()]);
        group.remove_member("alice");
        assert!(!group.is_member("alice"));
        assert!(!group.is_admin("alice"));
        assert!(!group.is_empty());
        group.remove_member("bob");
        assert!(group.is_empty());
    }
}
