//! User profile rows
//!
//! A `User` is mutated only by its owner; every other device mirrors it
//! read-only. Field names serialize in the backend's camelCase layout.

use serde::{Deserialize, Serialize};

/// A user profile document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    /// Globally unique identifier
    pub uid: String,
    /// Display name asserted by the profile owner
    pub name: String,
    /// Phone number used for contact lookup
    pub phone: String,
    /// Email address, if set
    pub email: Option<String>,
    /// Avatar URL in object storage, if set
    pub avatar_url: Option<String>,
    /// Free-form status line
    pub status_text: String,
    /// Current push-delivery token for this user's device
    pub push_token: Option<String>,
}

impl User {
    /// Create a user with the given identity and name
    pub fn new(uid: impl Into<String>, name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            phone: phone.into(),
            ..Default::default()
        }
    }
}
