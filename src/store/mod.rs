//! Local store module
//!
//! Durable on-device tables that survive process restarts and serve the UI
//! when offline. Writes are last-write-wins at the row level; deletion is
//! always explicit (a snapshot never prunes rows by omission).
//!
//! The module is organized into submodules:
//! - `user` - profile rows mirrored from the backend
//! - `contact` - per-owner aliases over users
//! - `conversation` - the per-owner conversation list rows
//! - `group` - group documents with set-semantics membership
//! - `message` - message rows, delivery state and tombstones
//! - `settings` - persisted engine configuration
//! - `store_db` - the SQLite-backed [`LocalStore`]

pub mod contact;
pub mod conversation;
pub mod group;
pub mod message;
pub mod settings;
pub mod store_db;
pub mod user;

pub use contact::Contact;
pub use conversation::Conversation;
pub use group::Group;
pub use message::{DeliveryState, Message, TOMBSTONE_BODY};
pub use settings::Settings;
pub use store_db::LocalStore;
pub use user::User;
