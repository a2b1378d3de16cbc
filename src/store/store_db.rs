//! SQLite-backed local store
//!
//! Durable table set with upsert-by-natural-key semantics and a change
//! signal. Rows are last-write-wins at row granularity: callers pass full
//! rows (or use the explicit field helpers), and no cross-row transaction
//! is offered beyond single-row atomicity.
//!
//! Consumers observe the store through [`LocalStore::watch`]: a revision
//! counter bumped after every committed write. A watcher re-queries on each
//! change instead of diffing, mirroring the snapshot contract of the remote
//! adapter.

use crate::store::{Contact, Conversation, DeliveryState, Group, Message, Settings, User};
use crate::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// SQLite-backed local store
pub struct LocalStore {
    conn: Mutex<Connection>,
    revision: watch::Sender<u64>,
}

impl LocalStore {
    /// Open (or create) a store at the given database path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let (revision, _) = watch::channel(0u64);
        let store = Self {
            conn: Mutex::new(conn),
            revision,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means a panic elsewhere; the connection
        // itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to the store's revision counter
    ///
    /// The value changes after every committed write; watchers re-run their
    /// queries on change.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|v| *v += 1);
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                uid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                phone TEXT NOT NULL,
                email TEXT,
                avatar_url TEXT,
                status_text TEXT NOT NULL,
                push_token TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS contacts (
                uid TEXT PRIMARY KEY,
                custom_name TEXT NOT NULL,
                phone TEXT NOT NULL,
                avatar_url TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                partner_id TEXT PRIMARY KEY,
                partner_name TEXT NOT NULL,
                partner_avatar_url TEXT,
                last_message TEXT NOT NULL,
                last_message_at INTEGER NOT NULL,
                partner_phone TEXT NOT NULL,
                unread_count INTEGER NOT NULL,
                is_group INTEGER NOT NULL,
                pinned_message_id TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                member_ids TEXT NOT NULL,
                admin_ids TEXT NOT NULL,
                avatar_url TEXT,
                last_message TEXT NOT NULL,
                last_message_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                body TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                sent_at INTEGER NOT NULL,
                delivery_state TEXT NOT NULL,
                read_by TEXT NOT NULL,
                was_deleted INTEGER NOT NULL,
                media_url TEXT,
                PRIMARY KEY (thread_id, id)
            )",
            [],
        )?;

        // Delete-for-me overlay: consulted at read time, never merged into
        // the shared message row.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS deleted_messages (
                thread_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                PRIMARY KEY (thread_id, message_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocked_users (
                uid TEXT PRIMARY KEY
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                max_transaction_retries INTEGER NOT NULL,
                enable_notifications INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_thread_sent
             ON messages(thread_id, sent_at ASC, id ASC)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conversations_last_message_at
             ON conversations(last_message_at DESC)",
            [],
        )?;

        Ok(())
    }

    // ========== Users ==========

    /// Save or update a user profile mirror
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO users (uid, name, phone, email, avatar_url, status_text, push_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &user.uid,
                &user.name,
                &user.phone,
                &user.email,
                &user.avatar_url,
                &user.status_text,
                &user.push_token,
            ],
        )?;
        self.bump();
        Ok(())
    }

    /// Load a user profile by uid
    pub fn get_user(&self, uid: &str) -> Result<Option<User>> {
        let result = self
            .conn()
            .query_row(
                "SELECT uid, name, phone, email, avatar_url, status_text, push_token
                 FROM users WHERE uid = ?1",
                params![uid],
                |row| {
                    Ok(User {
                        uid: row.get(0)?,
                        name: row.get(1)?,
                        phone: row.get(2)?,
                        email: row.get(3)?,
                        avatar_url: row.get(4)?,
                        status_text: row.get(5)?,
                        push_token: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    // ========== Contacts ==========

    /// Save or update a contact
    pub fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO contacts (uid, custom_name, phone, avatar_url)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &contact.uid,
                &contact.custom_name,
                &contact.phone,
                &contact.avatar_url,
            ],
        )?;
        self.bump();
        Ok(())
    }

    /// Load a contact by uid
    pub fn get_contact(&self, uid: &str) -> Result<Option<Contact>> {
        let result = self
            .conn()
            .query_row(
                "SELECT uid, custom_name, phone, avatar_url FROM contacts WHERE uid = ?1",
                params![uid],
                |row| {
                    Ok(Contact {
                        uid: row.get(0)?,
                        custom_name: row.get(1)?,
                        phone: row.get(2)?,
                        avatar_url: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    /// Load all contacts
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT uid, custom_name, phone, avatar_url FROM contacts")?;
        let contacts = stmt
            .query_map([], |row| {
                Ok(Contact {
                    uid: row.get(0)?,
                    custom_name: row.get(1)?,
                    phone: row.get(2)?,
                    avatar_url: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(contacts)
    }

    /// Delete a contact
    pub fn delete_contact(&self, uid: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM contacts WHERE uid = ?1", params![uid])?;
        self.bump();
        Ok(())
    }

    // ========== Conversations ==========

    /// Save or update a conversation row
    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO conversations
             (partner_id, partner_name, partner_avatar_url, last_message, last_message_at,
              partner_phone, unread_count, is_group, pinned_message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &conversation.partner_id,
                &conversation.partner_name,
                &conversation.partner_avatar_url,
                &conversation.last_message,
                conversation.last_message_at,
                &conversation.partner_phone,
                conversation.unread_count,
                conversation.is_group as i32,
                &conversation.pinned_message_id,
            ],
        )?;
        self.bump();
        Ok(())
    }

    fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
        let is_group: i32 = row.get(7)?;
        Ok(Conversation {
            partner_id: row.get(0)?,
            partner_name: row.get(1)?,
            partner_avatar_url: row.get(2)?,
            last_message: row.get(3)?,
            last_message_at: row.get(4)?,
            partner_phone: row.get(5)?,
            unread_count: row.get(6)?,
            is_group: is_group != 0,
            pinned_message_id: row.get(8)?,
        })
    }

    /// Load a conversation row by partner id
    pub fn get_conversation(&self, partner_id: &str) -> Result<Option<Conversation>> {
        let result = self
            .conn()
            .query_row(
                "SELECT partner_id, partner_name, partner_avatar_url, last_message,
                        last_message_at, partner_phone, unread_count, is_group, pinned_message_id
                 FROM conversations WHERE partner_id = ?1",
                params![partner_id],
                Self::conversation_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Load all conversation rows, newest activity first
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT partner_id, partner_name, partner_avatar_url, last_message,
                    last_message_at, partner_phone, unread_count, is_group, pinned_message_id
             FROM conversations ORDER BY last_message_at DESC, partner_id ASC",
        )?;
        let conversations = stmt
            .query_map([], Self::conversation_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(conversations)
    }

    /// Delete a conversation row (relationship or group membership ended)
    pub fn delete_conversation(&self, partner_id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM conversations WHERE partner_id = ?1",
            params![partner_id],
        )?;
        self.bump();
        Ok(())
    }

    /// Reset the unread counter of a conversation to zero
    pub fn reset_unread(&self, partner_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET unread_count = 0 WHERE partner_id = ?1",
            params![partner_id],
        )?;
        self.bump();
        Ok(())
    }

    /// Patch the pinned message id of a conversation row
    pub fn set_pinned_message(&self, partner_id: &str, message_id: Option<&str>) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET pinned_message_id = ?2 WHERE partner_id = ?1",
            params![partner_id, message_id],
        )?;
        self.bump();
        Ok(())
    }

    /// Patch the last-message preview of a conversation row
    pub fn set_last_message(&self, partner_id: &str, preview: &str, at: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET last_message = ?2, last_message_at = ?3
             WHERE partner_id = ?1",
            params![partner_id, preview, at],
        )?;
        self.bump();
        Ok(())
    }

    // ========== Groups ==========

    /// Save or update a group document mirror
    pub fn upsert_group(&self, group: &Group) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO groups
             (id, name, member_ids, admin_ids, avatar_url, last_message, last_message_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &group.id,
                &group.name,
                serde_json::to_string(&group.member_ids)?,
                serde_json::to_string(&group.admin_ids)?,
                &group.avatar_url,
                &group.last_message,
                group.last_message_at,
            ],
        )?;
        self.bump();
        Ok(())
    }

    fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Group, String, String)> {
        Ok((
            Group {
                id: row.get(0)?,
                name: row.get(1)?,
                member_ids: Vec::new(),
                admin_ids: Vec::new(),
                avatar_url: row.get(4)?,
                last_message: row.get(5)?,
                last_message_at: row.get(6)?,
            },
            row.get(2)?,
            row.get(3)?,
        ))
    }

    fn decode_group((mut group, members, admins): (Group, String, String)) -> Result<Group> {
        group.member_ids = serde_json::from_str(&members)?;
        group.admin_ids = serde_json::from_str(&admins)?;
        Ok(group)
    }

    /// Load a group by id
    pub fn get_group(&self, id: &str) -> Result<Option<Group>> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, name, member_ids, admin_ids, avatar_url, last_message, last_message_at
                 FROM groups WHERE id = ?1",
                params![id],
                Self::group_from_row,
            )
            .optional()?;
        row.map(Self::decode_group).transpose()
    }

    /// Load all known groups
    pub fn list_groups(&self) -> Result<Vec<Group>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, member_ids, admin_ids, avatar_url, last_message, last_message_at
             FROM groups",
        )?;
        let rows = stmt
            .query_map([], Self::group_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::decode_group).collect()
    }

    /// Delete a group mirror (left, removed, or the group drained)
    pub fn delete_group(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM groups WHERE id = ?1", params![id])?;
        self.bump();
        Ok(())
    }

    // ========== Messages ==========

    /// Save or update a message row
    pub fn upsert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO messages
             (id, thread_id, body, sender_id, sent_at, delivery_state, read_by, was_deleted, media_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &message.id,
                &message.thread_id,
                &message.body,
                &message.sender_id,
                message.sent_at,
                serde_json::to_string(&message.delivery_state)?,
                serde_json::to_string(&message.read_by)?,
                message.was_deleted as i32,
                &message.media_url,
            ],
        )?;
        self.bump();
        Ok(())
    }

    fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Message, String, String)> {
        let was_deleted: i32 = row.get(7)?;
        Ok((
            Message {
                id: row.get(0)?,
                thread_id: row.get(1)?,
                body: row.get(2)?,
                sender_id: row.get(3)?,
                sent_at: row.get(4)?,
                delivery_state: DeliveryState::Sent,
                read_by: Vec::new(),
                was_deleted: was_deleted != 0,
                media_url: row.get(8)?,
            },
            row.get(5)?,
            row.get(6)?,
        ))
    }

    fn decode_message((mut message, state, read_by): (Message, String, String)) -> Result<Message> {
        message.delivery_state = serde_json::from_str(&state)?;
        message.read_by = serde_json::from_str(&read_by)?;
        Ok(message)
    }

    /// Load one message by thread and id
    pub fn get_message(&self, thread_id: &str, id: &str) -> Result<Option<Message>> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, thread_id, body, sender_id, sent_at, delivery_state, read_by,
                        was_deleted, media_url
                 FROM messages WHERE thread_id = ?1 AND id = ?2",
                params![thread_id, id],
                Self::message_from_row,
            )
            .optional()?;
        row.map(Self::decode_message).transpose()
    }

    /// Load the full thread, oldest first, ties broken by id
    pub fn messages_for_thread(&self, thread_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, body, sender_id, sent_at, delivery_state, read_by,
                    was_deleted, media_url
             FROM messages WHERE thread_id = ?1 ORDER BY sent_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![thread_id], Self::message_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::decode_message).collect()
    }

    /// Most recent message of a thread, if any
    pub fn latest_message(&self, thread_id: &str) -> Result<Option<Message>> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, thread_id, body, sender_id, sent_at, delivery_state, read_by,
                        was_deleted, media_url
                 FROM messages WHERE thread_id = ?1 ORDER BY sent_at DESC, id DESC LIMIT 1",
                params![thread_id],
                Self::message_from_row,
            )
            .optional()?;
        row.map(Self::decode_message).transpose()
    }

    // ========== Delete-for-me overlay ==========

    /// Add a message id to the owner's exclusion set for a thread
    pub fn add_deleted_message(&self, thread_id: &str, message_id: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO deleted_messages (thread_id, message_id) VALUES (?1, ?2)",
            params![thread_id, message_id],
        )?;
        self.bump();
        Ok(())
    }

    /// The owner's exclusion set for a thread
    pub fn deleted_messages(&self, thread_id: &str) -> Result<HashSet<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT message_id FROM deleted_messages WHERE thread_id = ?1")?;
        let ids = stmt
            .query_map(params![thread_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    // ========== Blocked users ==========

    /// Replace the blocked-user set with the authoritative snapshot
    pub fn replace_blocked_users(&self, uids: &HashSet<String>) -> Result<()> {
        {
            let conn = self.conn();
            conn.execute("DELETE FROM blocked_users", [])?;
            let mut stmt = conn.prepare("INSERT INTO blocked_users (uid) VALUES (?1)")?;
            for uid in uids {
                stmt.execute(params![uid])?;
            }
        }
        self.bump();
        Ok(())
    }

    /// The current blocked-user set
    pub fn blocked_users(&self) -> Result<HashSet<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT uid FROM blocked_users")?;
        let uids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(uids)
    }

    // ========== Settings ==========

    /// Persist the engine settings row
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO settings (id, max_transaction_retries, enable_notifications)
             VALUES (1, ?1, ?2)",
            params![
                settings.max_transaction_retries,
                settings.enable_notifications as i32,
            ],
        )?;
        self.bump();
        Ok(())
    }

    /// Load the engine settings, or defaults when never saved
    pub fn load_settings(&self) -> Result<Settings> {
        let result = self
            .conn()
            .query_row(
                "SELECT max_transaction_retries, enable_notifications FROM settings WHERE id = 1",
                [],
                |row| {
                    let enable: i32 = row.get(1)?;
                    Ok(Settings {
                        max_transaction_retries: row.get(0)?,
                        enable_notifications: enable != 0,
                    })
                },
            )
            .optional()?;
        Ok(result.unwrap_or_default())
    }
}
