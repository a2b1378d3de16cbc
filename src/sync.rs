//! Sync coordinator
//!
//! All client-driven mutations and the inbound reconciliation loop. Writes
//! follow a two-phase shape: the primary artifact (message documents, group
//! membership) is written first and failures surface as typed errors, then
//! the derived metadata (conversation previews, unread counters, presence
//! of a pin) fans out best-effort with failures logged and swallowed. The
//! repair for a partial fan-out is convergence: snapshots re-apply
//! idempotently, and [`SyncEngine::reconcile_group`] re-asserts group
//! metadata on demand.

use crate::paths;
use crate::presence::StatusKv;
use crate::remote::{from_document, to_document, Document, RemoteStore, Snapshot, WriteKind};
use crate::store::{
    Contact, Conversation, Group, LocalStore, Message, Settings, User, TOMBSTONE_BODY,
};
use crate::{Error, Result};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

fn fields(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// The sync coordinator for one authenticated user
pub struct SyncEngine {
    local: Arc<LocalStore>,
    remote: Arc<RemoteStore>,
    status: Arc<StatusKv>,
    self_uid: String,
    settings: Settings,
}

/// Handle over the spawned subscription tasks
pub struct SyncHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Cancel every subscription task
    pub fn stop(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A server-rendered notification block inside a push payload
#[derive(Debug, Clone)]
pub struct PushNotification {
    /// Notification title
    pub title: String,
    /// Notification body
    pub body: String,
}

/// An incoming push payload
#[derive(Debug, Clone, Default)]
pub struct PushPayload {
    /// Server-rendered notification, if the sender attached one
    pub notification: Option<PushNotification>,
    /// Data fields for client-side rendering
    pub data: HashMap<String, String>,
}

/// A notification the client should render locally
#[derive(Debug, Clone, PartialEq)]
pub struct LocalNotification {
    /// Title line
    pub title: String,
    /// Body line
    pub body: String,
    /// Conversation to open on tap, if the payload named one
    pub partner_id: Option<String>,
}

impl SyncEngine {
    /// Create an engine for the authenticated user `self_uid`
    pub fn new(
        local: Arc<LocalStore>,
        remote: Arc<RemoteStore>,
        status: Arc<StatusKv>,
        self_uid: impl Into<String>,
    ) -> Result<Self> {
        let self_uid = self_uid.into();
        if self_uid.is_empty() {
            return Err(Error::NotAuthenticated);
        }
        let settings = local.load_settings()?;
        Ok(Self {
            local,
            remote,
            status,
            self_uid,
            settings,
        })
    }

    /// The authenticated uid this engine acts as
    pub fn self_uid(&self) -> &str {
        &self.self_uid
    }

    /// The status store presence reads go through
    pub fn status(&self) -> &Arc<StatusKv> {
        &self.status
    }

    /// The local store backing this engine
    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    /// The remote store this engine writes through
    pub fn remote(&self) -> &Arc<RemoteStore> {
        &self.remote
    }

    fn peer_thread(&self, peer: &str) -> String {
        paths::thread_id(&self.self_uid, peer)
    }

    fn both_partitions(&self, peer: &str) -> [String; 2] {
        [
            paths::partition_id(&self.self_uid, peer),
            paths::partition_id(peer, &self.self_uid),
        ]
    }

    // ========== Sending ==========

    /// Send a 1:1 message
    ///
    /// The message lands locally first (optimistic, `Sent`), then as an
    /// identical document in both thread partitions. Conversation previews
    /// and the receiver's unread counter fan out best-effort afterwards.
    pub async fn send_message(&self, peer: &str, body: &str) -> Result<Message> {
        let id = Uuid::new_v4().to_string();
        let thread = self.peer_thread(peer);
        let sent_at = self.remote.clock().now_ms();
        let message = Message::new(&id, &thread, body, &self.self_uid, sent_at);

        self.local.upsert_message(&message)?;

        let doc = to_document(&message)?;
        let writes = self
            .both_partitions(peer)
            .iter()
            .map(|partition| {
                (
                    paths::chat_message_doc(partition, &id),
                    WriteKind::Set(doc.clone()),
                )
            })
            .collect();
        self.remote.write_batch(writes).await?;
        info!(peer = %peer, message_id = %id, "Message mirrored to both partitions");

        self.fan_out_peer_previews(peer, body, sent_at).await;
        self.bump_local_preview(peer, &format!("You: {}", body), sent_at, false)?;
        Ok(message)
    }

    /// The sender's own profile, from the local mirror or the backend
    ///
    /// Consulted when fanning out to the receiver's conversation row so a
    /// first-contact message arrives already named.
    async fn sender_profile(&self) -> Option<User> {
        if let Ok(Some(user)) = self.local.get_user(&self.self_uid) {
            return Some(user);
        }
        match self.remote.get(&paths::user_doc(&self.self_uid)).await {
            Ok(Some(doc)) => from_document(&doc).ok(),
            _ => None,
        }
    }

    async fn fan_out_peer_previews(&self, peer: &str, body: &str, sent_at: i64) {
        let mut receiver_row = fields(json!({
            "partnerId": self.self_uid,
            "lastMessage": body,
            "lastMessageAt": sent_at,
        }));
        if let Some(profile) = self.sender_profile().await {
            receiver_row.insert("partnerName".to_string(), json!(profile.name));
            receiver_row.insert("partnerAvatarUrl".to_string(), json!(profile.avatar_url));
            receiver_row.insert("partnerPhone".to_string(), json!(profile.phone));
        }
        let writes = vec![
            (
                paths::conversation_doc(&self.self_uid, peer),
                WriteKind::Merge(fields(json!({
                    "partnerId": peer,
                    "lastMessage": format!("You: {}", body),
                    "lastMessageAt": sent_at,
                    "unreadCount": 0,
                }))),
            ),
            (
                paths::conversation_doc(peer, &self.self_uid),
                WriteKind::Merge(receiver_row),
            ),
            (
                paths::conversation_doc(peer, &self.self_uid),
                WriteKind::Increment {
                    field: "unreadCount".to_string(),
                    by: 1,
                },
            ),
        ];
        if let Err(e) = self.remote.write_batch(writes).await {
            warn!(peer = %peer, error = %e, "Conversation fan-out failed, will converge later");
        }
    }

    fn bump_local_preview(
        &self,
        partner_id: &str,
        preview: &str,
        at: i64,
        is_group: bool,
    ) -> Result<()> {
        match self.local.get_conversation(partner_id)? {
            Some(_) => self.local.set_last_message(partner_id, preview, at),
            None => {
                let name = self
                    .partner_display_name(partner_id, is_group)?
                    .unwrap_or_else(|| partner_id.to_string());
                let mut row = if is_group {
                    Conversation::with_group(partner_id, name)
                } else {
                    Conversation::with_peer(partner_id, name)
                };
                row.last_message = preview.to_string();
                row.last_message_at = at;
                self.local.upsert_conversation(&row)
            }
        }
    }

    fn partner_display_name(&self, partner_id: &str, is_group: bool) -> Result<Option<String>> {
        if is_group {
            return Ok(self.local.get_group(partner_id)?.map(|g| g.name));
        }
        if let Some(contact) = self.local.get_contact(partner_id)? {
            if !contact.custom_name.is_empty() {
                return Ok(Some(contact.custom_name));
            }
        }
        Ok(self.local.get_user(partner_id)?.map(|u| u.name))
    }

    /// Send a message to a group the user is a member of
    pub async fn send_group_message(&self, group_id: &str, body: &str) -> Result<Message> {
        let group = self
            .local
            .get_group(group_id)?
            .ok_or_else(|| Error::NotFound(format!("group {}", group_id)))?;
        if !group.is_member(&self.self_uid) {
            return Err(Error::PermissionDenied(format!(
                "not a member of group {}",
                group_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        let sent_at = self.remote.clock().now_ms();
        let message = Message::new(&id, group_id, body, &self.self_uid, sent_at);

        self.local.upsert_message(&message)?;
        self.remote
            .write(
                &paths::group_message_doc(group_id, &id),
                WriteKind::Set(to_document(&message)?),
            )
            .await?;

        self.fan_out_group_previews(&group, body, sent_at).await;
        self.bump_local_preview(group_id, &format!("You: {}", body), sent_at, true)?;
        Ok(message)
    }

    async fn fan_out_group_previews(&self, group: &Group, body: &str, sent_at: i64) {
        let mut writes = vec![(
            paths::group_doc(&group.id),
            WriteKind::Merge(fields(json!({
                "lastMessage": body,
                "lastMessageAt": sent_at,
            }))),
        )];
        for member in &group.member_ids {
            let row = paths::conversation_doc(member, &group.id);
            if member == &self.self_uid {
                writes.push((
                    row,
                    WriteKind::Merge(fields(json!({
                        "partnerId": group.id,
                        "partnerName": group.name,
                        "isGroup": true,
                        "lastMessage": format!("You: {}", body),
                        "lastMessageAt": sent_at,
                        "unreadCount": 0,
                    }))),
                ));
            } else {
                writes.push((
                    row.clone(),
                    WriteKind::Merge(fields(json!({
                        "partnerId": group.id,
                        "partnerName": group.name,
                        "isGroup": true,
                        "lastMessage": body,
                        "lastMessageAt": sent_at,
                    }))),
                ));
                writes.push((
                    row,
                    WriteKind::Increment {
                        field: "unreadCount".to_string(),
                        by: 1,
                    },
                ));
            }
        }
        if let Err(e) = self.remote.write_batch(writes).await {
            warn!(group_id = %group.id, error = %e, "Group fan-out failed, will converge later");
        }
    }

    // ========== Read receipts ==========

    /// Acknowledge every unread peer-authored message in a 1:1 thread
    ///
    /// Re-running on a clean thread performs zero remote message writes.
    pub async fn mark_thread_read(&self, peer: &str) -> Result<()> {
        let thread = self.peer_thread(peer);
        let unread: Vec<Message> = self
            .local
            .messages_for_thread(&thread)?
            .into_iter()
            .filter(|m| m.sender_id != self.self_uid && !m.is_read_by(&self.self_uid))
            .collect();

        let counter_dirty = self
            .local
            .get_conversation(peer)?
            .map(|c| c.unread_count > 0)
            .unwrap_or(false);
        if unread.is_empty() && !counter_dirty {
            return Ok(());
        }

        if !unread.is_empty() {
            let mut writes = Vec::new();
            for message in &unread {
                for partition in self.both_partitions(peer) {
                    let path = paths::chat_message_doc(&partition, &message.id);
                    writes.push((
                        path.clone(),
                        WriteKind::Merge(fields(json!({ "deliveryState": "READ" }))),
                    ));
                    writes.push((
                        path,
                        WriteKind::ArrayUnion {
                            field: "readBy".to_string(),
                            values: vec![json!(self.self_uid)],
                        },
                    ));
                }
            }
            self.remote.write_batch(writes).await?;

            for mut message in unread {
                message.mark_read_by(&self.self_uid);
                self.local.upsert_message(&message)?;
            }
        }

        self.local.reset_unread(peer)?;
        let reset = self
            .remote
            .write(
                &paths::conversation_doc(&self.self_uid, peer),
                WriteKind::Merge(fields(json!({ "unreadCount": 0 }))),
            )
            .await;
        if let Err(e) = reset {
            warn!(peer = %peer, error = %e, "Remote unread reset failed, will converge later");
        }
        Ok(())
    }

    /// Acknowledge unread messages in a group thread
    pub async fn mark_group_read(&self, group_id: &str) -> Result<()> {
        let unread: Vec<Message> = self
            .local
            .messages_for_thread(group_id)?
            .into_iter()
            .filter(|m| m.sender_id != self.self_uid && !m.is_read_by(&self.self_uid))
            .collect();

        if !unread.is_empty() {
            let writes = unread
                .iter()
                .map(|message| {
                    (
                        paths::group_message_doc(group_id, &message.id),
                        WriteKind::ArrayUnion {
                            field: "readBy".to_string(),
                            values: vec![json!(self.self_uid)],
                        },
                    )
                })
                .collect();
            self.remote.write_batch(writes).await?;

            for mut message in unread {
                // In a group the read set grows per reader; delivery state
                // stays whatever the sender's side computed.
                if !message.is_read_by(&self.self_uid) {
                    message.read_by.push(self.self_uid.clone());
                }
                self.local.upsert_message(&message)?;
            }
        }

        self.local.reset_unread(group_id)?;
        let reset = self
            .remote
            .write(
                &paths::conversation_doc(&self.self_uid, group_id),
                WriteKind::Merge(fields(json!({ "unreadCount": 0 }))),
            )
            .await;
        if let Err(e) = reset {
            warn!(group_id = %group_id, error = %e, "Remote unread reset failed");
        }
        Ok(())
    }

    // ========== Deletion ==========

    /// Replace a message with its tombstone in both partitions
    ///
    /// Only the author may delete for everyone. The row keeps its id and
    /// timestamp; when the victim was the newest message the conversation
    /// previews are re-pointed at the tombstone text.
    pub async fn delete_message_for_everyone(&self, peer: &str, message_id: &str) -> Result<()> {
        let thread = self.peer_thread(peer);
        let mut message = self
            .local
            .get_message(&thread, message_id)?
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))?;
        if message.sender_id != self.self_uid {
            return Err(Error::PermissionDenied(
                "only the author may delete for everyone".to_string(),
            ));
        }

        let patch = fields(json!({
            "body": TOMBSTONE_BODY,
            "wasDeleted": true,
            "mediaUrl": Value::Null,
        }));
        let writes = self
            .both_partitions(peer)
            .iter()
            .map(|partition| {
                (
                    paths::chat_message_doc(partition, message_id),
                    WriteKind::Merge(patch.clone()),
                )
            })
            .collect();
        self.remote.write_batch(writes).await?;

        message.tombstone();
        self.local.upsert_message(&message)?;

        let newest = self
            .local
            .latest_message(&thread)?
            .map(|m| m.id == message.id)
            .unwrap_or(false);
        if newest {
            self.local
                .set_last_message(peer, TOMBSTONE_BODY, message.sent_at)?;
            let preview = fields(json!({ "lastMessage": TOMBSTONE_BODY }));
            let fan_out = self
                .remote
                .write_batch(vec![
                    (
                        paths::conversation_doc(&self.self_uid, peer),
                        WriteKind::Merge(preview.clone()),
                    ),
                    (
                        paths::conversation_doc(peer, &self.self_uid),
                        WriteKind::Merge(preview),
                    ),
                ])
                .await;
            if let Err(e) = fan_out {
                warn!(peer = %peer, error = %e, "Tombstone preview fan-out failed");
            }
        }
        Ok(())
    }

    /// Hide a message from this user only
    ///
    /// The id joins the owner's exclusion overlay; the shared row is never
    /// touched, so the other participant still sees the message.
    pub async fn delete_message_for_me(&self, peer: &str, message_id: &str) -> Result<()> {
        let thread = self.peer_thread(peer);
        if self.local.get_message(&thread, message_id)?.is_none() {
            return Err(Error::NotFound(format!("message {}", message_id)));
        }

        self.remote
            .write(
                &paths::deleted_messages_doc(&self.self_uid, &thread),
                WriteKind::ArrayUnion {
                    field: "messageIds".to_string(),
                    values: vec![json!(message_id)],
                },
            )
            .await?;
        self.local.add_deleted_message(&thread, message_id)?;
        Ok(())
    }

    /// Replace a group message with its tombstone
    ///
    /// Same contract as the 1:1 form, against the group's single message
    /// partition; the newest-message case re-points the group document and
    /// every member's conversation row.
    pub async fn delete_group_message_for_everyone(
        &self,
        group_id: &str,
        message_id: &str,
    ) -> Result<()> {
        let mut message = self
            .local
            .get_message(group_id, message_id)?
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))?;
        if message.sender_id != self.self_uid {
            return Err(Error::PermissionDenied(
                "only the author may delete for everyone".to_string(),
            ));
        }
        let group = self
            .local
            .get_group(group_id)?
            .ok_or_else(|| Error::NotFound(format!("group {}", group_id)))?;

        self.remote
            .write(
                &paths::group_message_doc(group_id, message_id),
                WriteKind::Merge(fields(json!({
                    "body": TOMBSTONE_BODY,
                    "wasDeleted": true,
                    "mediaUrl": Value::Null,
                }))),
            )
            .await?;

        message.tombstone();
        self.local.upsert_message(&message)?;

        let newest = self
            .local
            .latest_message(group_id)?
            .map(|m| m.id == message.id)
            .unwrap_or(false);
        if newest {
            self.local
                .set_last_message(group_id, TOMBSTONE_BODY, message.sent_at)?;
            let preview = fields(json!({ "lastMessage": TOMBSTONE_BODY }));
            let mut writes = vec![(paths::group_doc(group_id), WriteKind::Merge(preview.clone()))];
            for member in &group.member_ids {
                writes.push((
                    paths::conversation_doc(member, group_id),
                    WriteKind::Merge(preview.clone()),
                ));
            }
            if let Err(e) = self.remote.write_batch(writes).await {
                warn!(group_id = %group_id, error = %e, "Tombstone preview fan-out failed");
            }
        }
        Ok(())
    }

    /// Hide a group message from this user only
    pub async fn delete_group_message_for_me(
        &self,
        group_id: &str,
        message_id: &str,
    ) -> Result<()> {
        if self.local.get_message(group_id, message_id)?.is_none() {
            return Err(Error::NotFound(format!("message {}", message_id)));
        }

        self.remote
            .write(
                &paths::deleted_messages_doc(&self.self_uid, group_id),
                WriteKind::ArrayUnion {
                    field: "messageIds".to_string(),
                    values: vec![json!(message_id)],
                },
            )
            .await?;
        self.local.add_deleted_message(group_id, message_id)?;
        Ok(())
    }

    // ========== Pinning ==========

    /// Pin a message on every participant's conversation row
    pub async fn pin_message(&self, partner_id: &str, message_id: &str) -> Result<()> {
        self.set_pin(partner_id, Some(message_id)).await
    }

    /// Clear the pin on every participant's conversation row
    pub async fn unpin_message(&self, partner_id: &str) -> Result<()> {
        self.set_pin(partner_id, None).await
    }

    async fn set_pin(&self, partner_id: &str, message_id: Option<&str>) -> Result<()> {
        let group = self.local.get_group(partner_id)?;
        let thread = match &group {
            Some(g) => g.id.clone(),
            None => self.peer_thread(partner_id),
        };
        if let Some(id) = message_id {
            if self.local.get_message(&thread, id)?.is_none() {
                return Err(Error::NotFound(format!("message {}", id)));
            }
        }

        let patch = fields(json!({
            "pinnedMessageId": message_id.map(Value::from).unwrap_or(Value::Null),
        }));
        let writes = match &group {
            Some(g) => g
                .member_ids
                .iter()
                .map(|member| {
                    (
                        paths::conversation_doc(member, partner_id),
                        WriteKind::Merge(patch.clone()),
                    )
                })
                .collect(),
            None => vec![
                (
                    paths::conversation_doc(&self.self_uid, partner_id),
                    WriteKind::Merge(patch.clone()),
                ),
                (
                    paths::conversation_doc(partner_id, &self.self_uid),
                    WriteKind::Merge(patch),
                ),
            ],
        };
        if let Err(e) = self.remote.write_batch(writes).await {
            // Rows that missed the patch converge on the next snapshot or
            // the next pin change.
            warn!(partner_id = %partner_id, error = %e, "Pin fan-out incomplete");
        }
        self.local.set_pinned_message(partner_id, message_id)?;
        Ok(())
    }

    // ========== Contacts & blocking ==========

    /// Add a contact by phone-number lookup, under a chosen display name
    pub async fn add_contact(&self, phone: &str, custom_name: &str) -> Result<Contact> {
        let matches = self
            .remote
            .query_eq(&paths::users_prefix(), "phone", &json!(phone))
            .await?;
        let (path, doc) = matches
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("no user with phone {}", phone)))?;
        let uid = paths::doc_id(&path).to_string();
        if uid == self.self_uid {
            return Err(Error::Storage(
                "Cannot add yourself as a contact".to_string(),
            ));
        }
        let user: User = from_document(&doc)?;

        let contact = Contact {
            uid: uid.clone(),
            custom_name: custom_name.to_string(),
            phone: phone.to_string(),
            avatar_url: user.avatar_url.clone(),
        };
        self.remote
            .write_batch(vec![
                (
                    paths::contact_doc(&self.self_uid, &uid),
                    WriteKind::Set(to_document(&contact)?),
                ),
                (
                    paths::conversation_doc(&self.self_uid, &uid),
                    WriteKind::Merge(fields(json!({
                        "partnerId": uid,
                        "partnerName": custom_name,
                        "partnerPhone": phone,
                        "partnerAvatarUrl": contact.avatar_url.clone(),
                    }))),
                ),
            ])
            .await?;

        self.local.upsert_contact(&contact)?;
        if self.local.get_conversation(&uid)?.is_none() {
            let mut row = Conversation::with_peer(&uid, custom_name);
            row.partner_phone = phone.to_string();
            row.partner_avatar_url = contact.avatar_url.clone();
            self.local.upsert_conversation(&row)?;
        }
        Ok(contact)
    }

    /// Remove a contact and its conversation row
    pub async fn delete_contact(&self, uid: &str) -> Result<()> {
        self.remote
            .write_batch(vec![
                (paths::contact_doc(&self.self_uid, uid), WriteKind::Delete),
                (
                    paths::conversation_doc(&self.self_uid, uid),
                    WriteKind::Delete,
                ),
            ])
            .await?;
        self.local.delete_contact(uid)?;
        self.local.delete_conversation(uid)?;
        Ok(())
    }

    /// Block a user; their conversation disappears from derived lists
    pub async fn block_user(&self, uid: &str) -> Result<()> {
        self.remote
            .write(
                &paths::blocked_doc(&self.self_uid, uid),
                WriteKind::Set(fields(json!({ "uid": uid }))),
            )
            .await?;
        let mut blocked = self.local.blocked_users()?;
        blocked.insert(uid.to_string());
        self.local.replace_blocked_users(&blocked)?;
        Ok(())
    }

    /// Unblock a user
    pub async fn unblock_user(&self, uid: &str) -> Result<()> {
        self.remote
            .write(&paths::blocked_doc(&self.self_uid, uid), WriteKind::Delete)
            .await?;
        let mut blocked = self.local.blocked_users()?;
        blocked.remove(uid);
        self.local.replace_blocked_users(&blocked)?;
        Ok(())
    }

    // ========== Groups ==========

    /// Create a group with the given members; the creator becomes admin
    pub async fn create_group(&self, name: &str, member_uids: &[String]) -> Result<Group> {
        if name.is_empty() {
            return Err(Error::Storage("Group name cannot be empty".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let now = self.remote.clock().now_ms();
        let mut group = Group::new(&id, name, &self.self_uid);
        group.add_members(member_uids);
        group.last_message = "Group created.".to_string();
        group.last_message_at = now;

        self.remote
            .write(&paths::group_doc(&id), WriteKind::Set(to_document(&group)?))
            .await?;

        let writes = group
            .member_ids
            .iter()
            .map(|member| {
                (
                    paths::conversation_doc(member, &id),
                    WriteKind::Merge(fields(json!({
                        "partnerId": id,
                        "partnerName": name,
                        "isGroup": true,
                        "lastMessage": "Group created.",
                        "lastMessageAt": now,
                    }))),
                )
            })
            .collect();
        if let Err(e) = self.remote.write_batch(writes).await {
            warn!(group_id = %id, error = %e, "Group creation fan-out incomplete");
        }

        self.local.upsert_group(&group)?;
        let mut row = Conversation::with_group(&id, name);
        row.last_message = "Group created.".to_string();
        row.last_message_at = now;
        self.local.upsert_conversation(&row)?;
        info!(group_id = %id, members = group.member_ids.len(), "Group created");
        Ok(group)
    }

    /// Add members to a group; admin-only
    pub async fn add_group_members(&self, group_id: &str, uids: &[String]) -> Result<()> {
        let mut group = self
            .local
            .get_group(group_id)?
            .ok_or_else(|| Error::NotFound(format!("group {}", group_id)))?;
        if !group.is_admin(&self.self_uid) {
            return Err(Error::PermissionDenied(
                "only admins may add members".to_string(),
            ));
        }

        self.remote
            .write(
                &paths::group_doc(group_id),
                WriteKind::ArrayUnion {
                    field: "memberIds".to_string(),
                    values: uids.iter().map(|u| json!(u)).collect(),
                },
            )
            .await?;

        let now = self.remote.clock().now_ms();
        let writes = uids
            .iter()
            .map(|uid| {
                (
                    paths::conversation_doc(uid, group_id),
                    WriteKind::Merge(fields(json!({
                        "partnerId": group_id,
                        "partnerName": group.name,
                        "isGroup": true,
                        "lastMessage": "You were added.",
                        "lastMessageAt": now,
                    }))),
                )
            })
            .collect();
        if let Err(e) = self.remote.write_batch(writes).await {
            warn!(group_id = %group_id, error = %e, "Member-add fan-out incomplete");
        }

        group.add_members(uids);
        self.local.upsert_group(&group)?;
        Ok(())
    }

    /// Remove a member from a group
    ///
    /// Allowed for admins, or for anyone removing themselves. Runs as a
    /// transaction over the group document: when the last member leaves the
    /// group document itself is deleted.
    pub async fn remove_group_member(&self, group_id: &str, uid: &str) -> Result<()> {
        let self_uid = self.self_uid.clone();
        let target = uid.to_string();
        let group_path = paths::group_doc(group_id);
        let conversation_path = paths::conversation_doc(uid, group_id);

        self.remote
            .run_transaction(
                std::slice::from_ref(&group_path),
                self.settings.max_transaction_retries,
                |reads| {
                    let doc = reads[0]
                        .as_ref()
                        .ok_or_else(|| Error::NotFound(format!("group {}", group_id)))?;
                    let admins = doc
                        .get("adminIds")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let is_admin = admins.contains(&json!(self_uid));
                    if target != self_uid && !is_admin {
                        return Err(Error::PermissionDenied(
                            "only admins may remove other members".to_string(),
                        ));
                    }

                    let members = doc
                        .get("memberIds")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let remaining = members.iter().filter(|m| **m != json!(target)).count();

                    let group_write = if remaining == 0 {
                        (group_path.clone(), WriteKind::Delete)
                    } else {
                        (
                            group_path.clone(),
                            WriteKind::ArrayRemove {
                                field: "memberIds".to_string(),
                                values: vec![json!(target)],
                            },
                        )
                    };
                    let mut writes = vec![group_write];
                    if remaining > 0 {
                        writes.push((
                            group_path.clone(),
                            WriteKind::ArrayRemove {
                                field: "adminIds".to_string(),
                                values: vec![json!(target)],
                            },
                        ));
                    }
                    writes.push((conversation_path.clone(), WriteKind::Delete));
                    Ok(writes)
                },
            )
            .await?;

        if uid == self.self_uid {
            self.local.delete_group(group_id)?;
            self.local.delete_conversation(group_id)?;
        } else if let Some(mut group) = self.local.get_group(group_id)? {
            group.remove_member(uid);
            if group.is_empty() {
                self.local.delete_group(group_id)?;
            } else {
                self.local.upsert_group(&group)?;
            }
        }
        Ok(())
    }

    /// Leave a group (self-removal)
    pub async fn leave_group(&self, group_id: &str) -> Result<()> {
        let uid = self.self_uid.clone();
        self.remove_group_member(group_id, &uid).await
    }

    /// Rename a group; admin-only
    pub async fn rename_group(&self, group_id: &str, new_name: &str) -> Result<()> {
        if new_name.is_empty() {
            return Err(Error::Storage("Group name cannot be empty".to_string()));
        }
        let mut group = self
            .local
            .get_group(group_id)?
            .ok_or_else(|| Error::NotFound(format!("group {}", group_id)))?;
        if !group.is_admin(&self.self_uid) {
            return Err(Error::PermissionDenied(
                "only admins may rename the group".to_string(),
            ));
        }

        self.remote
            .write(
                &paths::group_doc(group_id),
                WriteKind::Update(fields(json!({ "name": new_name }))),
            )
            .await?;

        let writes = group
            .member_ids
            .iter()
            .map(|member| {
                (
                    paths::conversation_doc(member, group_id),
                    WriteKind::Merge(fields(json!({ "partnerName": new_name }))),
                )
            })
            .collect();
        if let Err(e) = self.remote.write_batch(writes).await {
            warn!(group_id = %group_id, error = %e, "Rename fan-out incomplete, reconcile to repair");
        }

        group.name = new_name.to_string();
        self.local.upsert_group(&group)?;
        if let Some(mut row) = self.local.get_conversation(group_id)? {
            row.partner_name = new_name.to_string();
            self.local.upsert_conversation(&row)?;
        }
        Ok(())
    }

    /// Re-assert group metadata on every member's conversation row
    ///
    /// The repair pass for a partial fan-out: reads the authoritative group
    /// document and merges its name and avatar into each member's row.
    pub async fn reconcile_group(&self, group_id: &str) -> Result<()> {
        let doc = self
            .remote
            .get(&paths::group_doc(group_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("group {}", group_id)))?;
        let group: Group = from_document(&doc)?;

        let writes = group
            .member_ids
            .iter()
            .map(|member| {
                (
                    paths::conversation_doc(member, group_id),
                    WriteKind::Merge(fields(json!({
                        "partnerId": group_id,
                        "partnerName": group.name,
                        "partnerAvatarUrl": group.avatar_url,
                        "isGroup": true,
                    }))),
                )
            })
            .collect();
        self.remote.write_batch(writes).await?;

        if group.is_member(&self.self_uid) {
            self.local.upsert_group(&group)?;
        }
        Ok(())
    }

    // ========== Profile ==========

    /// Change the user's display name and propagate it to every
    /// conversation row that points at them
    pub async fn set_display_name(&self, name: &str) -> Result<()> {
        self.remote
            .write(
                &paths::user_doc(&self.self_uid),
                WriteKind::Merge(fields(json!({ "name": name }))),
            )
            .await?;
        self.propagate_profile_field("partnerName", json!(name)).await;
        if let Some(mut user) = self.local.get_user(&self.self_uid)? {
            user.name = name.to_string();
            self.local.upsert_user(&user)?;
        }
        Ok(())
    }

    /// Change the user's avatar and propagate it
    pub async fn set_avatar_url(&self, url: Option<&str>) -> Result<()> {
        self.remote
            .write(
                &paths::user_doc(&self.self_uid),
                WriteKind::Merge(fields(json!({ "avatarUrl": url }))),
            )
            .await?;
        self.propagate_profile_field("partnerAvatarUrl", json!(url))
            .await;
        if let Some(mut user) = self.local.get_user(&self.self_uid)? {
            user.avatar_url = url.map(str::to_string);
            self.local.upsert_user(&user)?;
        }
        Ok(())
    }

    async fn propagate_profile_field(&self, field: &str, value: Value) {
        let rows = match self
            .remote
            .query_collection_group("conversations", "partnerId", &json!(self.self_uid))
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Profile propagation lookup failed");
                return;
            }
        };
        let writes = rows
            .into_iter()
            .map(|(path, _)| {
                let mut patch = Document::new();
                patch.insert(field.to_string(), value.clone());
                (path, WriteKind::Merge(patch))
            })
            .collect();
        if let Err(e) = self.remote.write_batch(writes).await {
            warn!(error = %e, "Profile propagation incomplete");
        }
    }

    /// Change the user's status line (profile-only, no propagation)
    pub async fn set_status_text(&self, text: &str) -> Result<()> {
        self.remote
            .write(
                &paths::user_doc(&self.self_uid),
                WriteKind::Merge(fields(json!({ "statusText": text }))),
            )
            .await?;
        if let Some(mut user) = self.local.get_user(&self.self_uid)? {
            user.status_text = text.to_string();
            self.local.upsert_user(&user)?;
        }
        Ok(())
    }

    /// Refresh the push token on the user's profile document
    pub async fn set_push_token(&self, token: &str) -> Result<()> {
        self.remote
            .write(
                &paths::user_doc(&self.self_uid),
                WriteKind::Merge(fields(json!({ "pushToken": token }))),
            )
            .await?;
        if let Some(mut user) = self.local.get_user(&self.self_uid)? {
            user.push_token = Some(token.to_string());
            self.local.upsert_user(&user)?;
        }
        Ok(())
    }

    // ========== Push ==========

    /// Decide whether an incoming push payload should render locally
    ///
    /// Payloads that already carry a server-rendered notification are
    /// dropped: the platform displayed them, and rendering again would
    /// duplicate the alert. Data-only payloads render when notifications
    /// are enabled.
    pub fn handle_push_payload(&self, payload: &PushPayload) -> Option<LocalNotification> {
        if payload.notification.is_some() {
            return None;
        }
        if !self.settings.enable_notifications {
            return None;
        }
        let body = payload.data.get("body")?;
        Some(LocalNotification {
            title: payload
                .data
                .get("title")
                .cloned()
                .unwrap_or_else(|| "New message".to_string()),
            body: body.clone(),
            partner_id: payload.data.get("senderId").cloned(),
        })
    }

    // ========== Inbound snapshots ==========

    /// Apply a conversations snapshot; rows upsert by partner id and absent
    /// rows are left alone
    pub fn apply_conversation_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        for (path, doc) in &snapshot.docs {
            let mut row: Conversation = from_document(doc)?;
            if row.partner_id.is_empty() {
                row.partner_id = paths::doc_id(path).to_string();
            }
            self.local.upsert_conversation(&row)?;
        }
        Ok(())
    }

    /// Apply a contacts snapshot
    pub fn apply_contact_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        for (path, doc) in &snapshot.docs {
            let mut contact: Contact = from_document(doc)?;
            if contact.uid.is_empty() {
                contact.uid = paths::doc_id(path).to_string();
            }
            self.local.upsert_contact(&contact)?;
        }
        Ok(())
    }

    /// Apply a blocked-users snapshot; the set is authoritative, so this is
    /// a full replacement
    pub fn apply_blocked_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let uids: HashSet<String> = snapshot
            .docs
            .iter()
            .map(|(path, _)| paths::doc_id(path).to_string())
            .collect();
        self.local.replace_blocked_users(&uids)
    }

    /// Apply a groups snapshot
    ///
    /// Membership is the one inbound event that cascades deletion: a group
    /// whose member list no longer contains this user drops the local group
    /// and its conversation row.
    pub fn apply_group_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        for (_, doc) in &snapshot.docs {
            let group: Group = from_document(doc)?;
            if group.is_member(&self.self_uid) {
                self.local.upsert_group(&group)?;
            } else if self.local.get_group(&group.id)?.is_some() {
                info!(group_id = %group.id, "Removed from group, dropping local state");
                self.local.delete_group(&group.id)?;
                self.local.delete_conversation(&group.id)?;
            }
        }
        Ok(())
    }

    /// Apply a message snapshot for one thread
    pub fn apply_message_snapshot(&self, thread_id: &str, snapshot: &Snapshot) -> Result<()> {
        for (path, doc) in &snapshot.docs {
            let mut message: Message = from_document(doc)?;
            message.thread_id = thread_id.to_string();
            if message.id.is_empty() {
                message.id = paths::doc_id(path).to_string();
            }
            self.local.upsert_message(&message)?;
        }
        Ok(())
    }

    /// Apply a delete-for-me overlay snapshot
    pub fn apply_deleted_messages_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        for (path, doc) in &snapshot.docs {
            let thread_id = paths::doc_id(path);
            if let Some(ids) = doc.get("messageIds").and_then(Value::as_array) {
                for id in ids.iter().filter_map(Value::as_str) {
                    self.local.add_deleted_message(thread_id, id)?;
                }
            }
        }
        Ok(())
    }

    // ========== Subscription loop ==========

    /// Spawn the standing subscriptions scoped to this user
    pub fn start(self: &Arc<Self>) -> SyncHandle {
        let subscriptions: Vec<(
            String,
            fn(&SyncEngine, &Snapshot) -> Result<()>,
        )> = vec![
            (
                paths::conversations_prefix(&self.self_uid),
                SyncEngine::apply_conversation_snapshot,
            ),
            (
                paths::contacts_prefix(&self.self_uid),
                SyncEngine::apply_contact_snapshot,
            ),
            (
                paths::blocked_prefix(&self.self_uid),
                SyncEngine::apply_blocked_snapshot,
            ),
            (paths::groups_prefix(), SyncEngine::apply_group_snapshot),
            (
                paths::deleted_messages_prefix(&self.self_uid),
                SyncEngine::apply_deleted_messages_snapshot,
            ),
        ];

        let tasks = subscriptions
            .into_iter()
            .map(|(prefix, apply)| {
                let engine = Arc::clone(self);
                let mut sub = self.remote.subscribe(&prefix);
                tokio::spawn(async move {
                    while let Some(snapshot) = sub.recv().await {
                        if let Err(e) = apply(&engine, &snapshot) {
                            warn!(prefix = %snapshot.prefix, error = %e, "Snapshot apply failed");
                        }
                    }
                })
            })
            .collect();
        SyncHandle { tasks }
    }

    /// Subscribe to a 1:1 thread while it is open on screen
    ///
    /// New snapshots land in the local store and are immediately
    /// acknowledged as read, the behavior of a visible thread.
    pub fn open_thread(self: &Arc<Self>, peer: &str) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let peer = peer.to_string();
        let partition = paths::partition_id(&self.self_uid, &peer);
        let mut sub = self.remote.subscribe(&paths::chat_messages_prefix(&partition));
        tokio::spawn(async move {
            let thread = engine.peer_thread(&peer);
            while let Some(snapshot) = sub.recv().await {
                if let Err(e) = engine.apply_message_snapshot(&thread, &snapshot) {
                    warn!(thread = %thread, error = %e, "Message snapshot apply failed");
                    continue;
                }
                if let Err(e) = engine.mark_thread_read(&peer).await {
                    warn!(peer = %peer, error = %e, "Auto read-ack failed");
                }
            }
        })
    }
}
