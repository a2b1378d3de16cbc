//! Presence channel
//!
//! Presence lives in a realtime key-value node per user, not in the
//! document store: `/status/{uid}` holds `{online, lastSeen}` with
//! server-assigned timestamps. A session arms a server-side disconnect
//! hook when it comes online, so an ungraceful termination (process kill,
//! network drop) still converges to an offline record without the client's
//! help. Presence writes are best-effort throughout: a failed write is
//! logged and swallowed, never surfaced to the caller.

use crate::paths;
use crate::remote::ServerClock;
use crate::{Error, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{info, warn};

/// A user's presence record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStatus {
    /// Whether a session is currently connected
    pub online: bool,
    /// Server timestamp (ms) of the last presence transition
    pub last_seen: i64,
}

struct StatusEntry {
    hook_armed: bool,
    tx: watch::Sender<Option<PresenceStatus>>,
}

/// Realtime key-value store of `/status/{uid}` nodes
///
/// Writes are last-write-wins by server timestamp. Each node supports one
/// armed disconnect hook per connection; the hook fires exactly once.
pub struct StatusKv {
    clock: Arc<ServerClock>,
    inner: Mutex<HashMap<String, StatusEntry>>,
    connected: AtomicBool,
}

impl StatusKv {
    /// Create a connected, empty status store
    pub fn new(clock: Arc<ServerClock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StatusEntry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry<'a>(
        map: &'a mut HashMap<String, StatusEntry>,
        uid: &str,
    ) -> &'a mut StatusEntry {
        map.entry(uid.to_string()).or_insert_with(|| {
            let (tx, _) = watch::channel(None);
            StatusEntry {
                hook_armed: false,
                tx,
            }
        })
    }

    /// Write a presence record for `uid` with a server-assigned timestamp
    pub fn set(&self, uid: &str, online: bool) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NetworkUnavailable);
        }
        let status = PresenceStatus {
            online,
            last_seen: self.clock.now_ms(),
        };
        let mut map = self.lock();
        let entry = Self::entry(&mut map, uid);
        entry.tx.send_replace(Some(status));
        Ok(())
    }

    /// Arm the disconnect hook for `uid`'s current connection
    ///
    /// When the connection is later severed without a graceful sign-off, the
    /// node converges to an offline record.
    pub fn arm_disconnect(&self, uid: &str) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NetworkUnavailable);
        }
        let mut map = self.lock();
        Self::entry(&mut map, uid).hook_armed = true;
        Ok(())
    }

    /// Sever `uid`'s connection ungracefully, firing the armed hook once
    pub fn drop_connection(&self, uid: &str) {
        let now = self.clock.now_ms();
        let mut map = self.lock();
        if let Some(entry) = map.get_mut(uid) {
            if entry.hook_armed {
                entry.hook_armed = false;
                entry.tx.send_replace(Some(PresenceStatus {
                    online: false,
                    last_seen: now,
                }));
                info!(node = %paths::status_node(uid), "Disconnect hook fired");
            }
        }
    }

    /// Flip connectivity of the whole store
    ///
    /// Disconnecting fires every armed hook, the server-side view of a
    /// client vanishing.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if !connected {
            let now = self.clock.now_ms();
            let mut map = self.lock();
            for entry in map.values_mut() {
                if entry.hook_armed {
                    entry.hook_armed = false;
                    entry.tx.send_replace(Some(PresenceStatus {
                        online: false,
                        last_seen: now,
                    }));
                }
            }
        }
    }

    /// Watch `uid`'s presence record; `None` until the first write
    pub fn watch_status(&self, uid: &str) -> watch::Receiver<Option<PresenceStatus>> {
        let mut map = self.lock();
        Self::entry(&mut map, uid).tx.subscribe()
    }

    /// Current presence record, if any
    pub fn get(&self, uid: &str) -> Option<PresenceStatus> {
        self.lock().get(uid).and_then(|e| *e.tx.borrow())
    }
}

/// Session-side presence state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    /// No presence write has been attempted yet
    Unknown,
    /// The session announced itself online and armed the disconnect hook
    Online,
    /// The session gracefully signed off
    OfflineIntent,
    /// The connection was severed; the hook has taken over
    Disconnected,
}

/// Per-session presence driver for one user
pub struct PresenceChannel {
    kv: Arc<StatusKv>,
    uid: String,
    state: PresenceState,
}

impl PresenceChannel {
    /// Create a channel for `uid` against the given status store
    pub fn new(kv: Arc<StatusKv>, uid: impl Into<String>) -> Self {
        Self {
            kv,
            uid: uid.into(),
            state: PresenceState::Unknown,
        }
    }

    /// Current session-side state
    pub fn state(&self) -> PresenceState {
        self.state
    }

    /// Announce the session online and (re)arm the disconnect hook
    pub fn go_online(&mut self) {
        if let Err(e) = self
            .kv
            .set(&self.uid, true)
            .and_then(|_| self.kv.arm_disconnect(&self.uid))
        {
            warn!(uid = %self.uid, error = %e, "Presence online write failed");
            return;
        }
        self.state = PresenceState::Online;
    }

    /// Gracefully sign off, writing an explicit offline record
    pub fn go_offline(&mut self) {
        if let Err(e) = self.kv.set(&self.uid, false) {
            warn!(uid = %self.uid, error = %e, "Presence offline write failed");
            return;
        }
        self.state = PresenceState::OfflineIntent;
    }

    /// React to an ungraceful connection loss
    pub fn handle_disconnect(&mut self) {
        self.kv.drop_connection(&self.uid);
        self.state = PresenceState::Disconnected;
    }
}

/// Human-readable last-seen line for a presence record
///
/// Same calendar day as `now` yields "today at HH:MM", the previous day
/// "yesterday at HH:MM", anything older "on DD/MM/YY at HH:MM".
pub fn format_last_seen(last_seen_ms: i64, now_ms: i64) -> String {
    let seen: DateTime<Utc> = DateTime::from_timestamp_millis(last_seen_ms).unwrap_or_default();
    let now: DateTime<Utc> = DateTime::from_timestamp_millis(now_ms).unwrap_or_default();

    let time = seen.format("%H:%M");
    if seen.date_naive() == now.date_naive() {
        format!("today at {}", time)
    } else if now.date_naive().pred_opt() == Some(seen.date_naive()) {
        format!("yesterday at {}", time)
    } else {
        format!(
            "on {:02}/{:02}/{:02} at {}",
            seen.day(),
            seen.month(),
            seen.year() % 100,
            time
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv() -> Arc<StatusKv> {
        Arc::new(StatusKv::new(Arc::new(ServerClock::new())))
    }

    #[test]
    fn test_go_online_then_graceful_offline() {
        let kv = kv();
        let mut channel = PresenceChannel::new(Arc::clone(&kv), "u1");

        channel.go_online();
        assert_eq!(channel.state(), PresenceState::Online);
        let status = kv.get("u1").unwrap();
        assert!(status.online);

        channel.go_offline();
        assert_eq!(channel.state(), PresenceState::OfflineIntent);
        let status = kv.get("u1").unwrap();
        assert!(!status.online);
    }

    #[test]
    fn test_disconnect_hook_fires_exactly_once() {
        let kv = kv();
        let mut channel = PresenceChannel::new(Arc::clone(&kv), "u1");
        channel.go_online();
        let online_seen = kv.get("u1").unwrap().last_seen;

        channel.handle_disconnect();
        let after_drop = kv.get("u1").unwrap();
        assert!(!after_drop.online);
        assert!(after_drop.last_seen > online_seen);

        // A second severance finds no armed hook.
        kv.drop_connection("u1");
        assert_eq!(kv.get("u1").unwrap(), after_drop);
    }

    #[test]
    fn test_store_disconnect_fires_all_armed_hooks() {
        let kv = kv();
        PresenceChannel::new(Arc::clone(&kv), "u1").go_online();
        PresenceChannel::new(Arc::clone(&kv), "u2").go_online();

        kv.set_connected(false);
        assert!(!kv.get("u1").unwrap().online);
        assert!(!kv.get("u2").unwrap().online);
    }

    #[test]
    fn test_offline_presence_write_is_swallowed() {
        let kv = kv();
        kv.set_connected(false);
        let mut channel = PresenceChannel::new(Arc::clone(&kv), "u1");
        channel.go_online();
        // Write failed quietly; the session never reached Online.
        assert_eq!(channel.state(), PresenceState::Unknown);
        assert!(kv.get("u1").is_none());
    }

    #[test]
    fn test_watch_status_observes_transitions() {
        let kv = kv();
        let rx = kv.watch_status("u1");
        assert!(rx.borrow().is_none());

        kv.set("u1", true).unwrap();
        assert!(rx.borrow().unwrap().online);
    }

    #[test]
    fn test_format_last_seen_buckets() {
        // 2024-01-15 10:30:00 UTC
        let now = 1_705_314_600_000;
        let same_day = now - 2 * 60 * 60 * 1000;
        let yesterday = now - 24 * 60 * 60 * 1000;
        let older = now - 10 * 24 * 60 * 60 * 1000;

        assert_eq!(format_last_seen(same_day, now), "today at 08:30");
        assert_eq!(format_last_seen(yesterday, now), "yesterday at 10:30");
        assert_eq!(format_last_seen(older, now), "on 05/01/24 at 10:30");
    }
}
