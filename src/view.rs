//! Pure view derivations
//!
//! The conversation list and thread timelines shown to a user are
//! derivations over local rows, computed fresh on every store revision.
//! Nothing here touches the network or mutates state, which keeps the
//! rendering rules testable as plain functions.

use crate::store::{Contact, Conversation, Message};
use std::collections::{HashMap, HashSet};

/// Conversation list filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChatFilter {
    /// Every visible conversation
    #[default]
    All,
    /// Conversations with a positive unread count
    Unread,
    /// Group conversations only
    Groups,
}

/// Derive the conversation list a user sees
///
/// Applies, in order: the contact custom-name overlay (a saved contact's
/// chosen name wins over the backend-asserted one), the blocked-user
/// filter, the case-insensitive name search, the chat filter, and finally
/// ordering by most recent activity (ties broken by partner id for a
/// stable list).
pub fn conversation_list(
    rows: &[Conversation],
    contacts: &[Contact],
    blocked: &HashSet<String>,
    search: &str,
    filter: ChatFilter,
) -> Vec<Conversation> {
    let custom_names: HashMap<&str, &str> = contacts
        .iter()
        .filter(|c| !c.custom_name.is_empty())
        .map(|c| (c.uid.as_str(), c.custom_name.as_str()))
        .collect();
    let needle = search.to_lowercase();

    let mut list: Vec<Conversation> = rows
        .iter()
        .filter(|row| row.is_group || !blocked.contains(&row.partner_id))
        .map(|row| {
            let mut row = row.clone();
            if !row.is_group {
                if let Some(name) = custom_names.get(row.partner_id.as_str()) {
                    row.partner_name = (*name).to_string();
                }
            }
            row
        })
        .filter(|row| needle.is_empty() || row.partner_name.to_lowercase().contains(&needle))
        .filter(|row| match filter {
            ChatFilter::All => true,
            ChatFilter::Unread => row.is_unread(),
            ChatFilter::Groups => row.is_group,
        })
        .collect();

    list.sort_by(|a, b| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.partner_id.cmp(&b.partner_id))
    });
    list
}

/// Derive the timeline of a thread as the owner sees it
///
/// Messages in the owner's delete-for-me overlay are excluded; the rest are
/// optionally narrowed by a case-insensitive body search and ordered oldest
/// first, ties broken by message id.
pub fn timeline(
    messages: &[Message],
    locally_deleted: &HashSet<String>,
    search: &str,
) -> Vec<Message> {
    let needle = search.to_lowercase();
    let mut list: Vec<Message> = messages
        .iter()
        .filter(|m| !locally_deleted.contains(&m.id))
        .filter(|m| needle.is_empty() || m.body.to_lowercase().contains(&needle))
        .cloned()
        .collect();
    list.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
    list
}
