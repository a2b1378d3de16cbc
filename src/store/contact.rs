//! Contact rows - per-owner aliases over users
//!
//! A contact never carries its owner explicitly: the local store belongs to
//! exactly one identity, and the remote copy lives under the owner's own
//! subcollection. `custom_name` overrides the backend-asserted display name
//! wherever the contact is rendered.

use serde::{Deserialize, Serialize};

/// A per-owner contact entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Contact {
    /// Uid of the referenced user
    pub uid: String,
    /// Owner-chosen display name; wins over the user's own name
    pub custom_name: String,
    /// Phone number the contact was added by
    pub phone: String,
    /// Avatar URL mirrored from the user profile
    pub avatar_url: Option<String>,
}

impl Contact {
    /// Create a new contact entry
    pub fn new(
        uid: impl Into<String>,
        custom_name: impl Into<String>,
        phone: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            custom_name: custom_name.into(),
            phone: phone.into(),
            avatar_url: None,
        }
    }
}
