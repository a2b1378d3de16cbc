//! Remote subscription adapter
//!
//! An in-process rendition of the backend surface the engine is written
//! against: a path-keyed document store with merge writes, array set
//! algebra, numeric increments, bounded optimistic transactions, live
//! prefix subscriptions and an online/offline switch.
//!
//! Subscriptions deliver full snapshots of a collection's direct children,
//! never diffs. While offline, subscriptions stall and writes fail with
//! [`Error::NetworkUnavailable`]; on reconnect every watcher receives a
//! fresh authoritative snapshot, which is what makes re-apply idempotence
//! in the sync layer load-bearing.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// A remote document: a flat map of named fields
pub type Document = serde_json::Map<String, Value>;

/// Serialize an entity into a remote document
pub fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Storage(format!(
            "Expected a JSON object, got {}",
            other
        ))),
    }
}

/// Deserialize an entity from a remote document
pub fn from_document<T: DeserializeOwned>(doc: &Document) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(doc.clone()))?)
}

/// Monotonic server-side clock in milliseconds
///
/// Every call returns a strictly larger value, so two writes never share a
/// timestamp and ordering by `sentAt` is total.
pub struct ServerClock {
    now_ms: AtomicI64,
}

impl ServerClock {
    /// Create a clock starting at a fixed epoch offset
    pub fn new() -> Self {
        Self {
            now_ms: AtomicI64::new(1_700_000_000_000),
        }
    }

    /// Current server time; strictly monotonic across calls
    pub fn now_ms(&self) -> i64 {
        self.now_ms.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Jump the clock forward (tests exercising day boundaries)
    pub fn advance_ms(&self, delta: i64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One remote mutation
#[derive(Debug, Clone)]
pub enum WriteKind {
    /// Replace the document wholesale, creating it if absent
    Set(Document),
    /// Merge fields into the document, creating it if absent
    Merge(Document),
    /// Merge fields into an existing document; fails if absent
    Update(Document),
    /// Remove the document; a no-op if absent
    Delete,
    /// Add values to an array field, skipping ones already present
    ArrayUnion {
        /// Array field name
        field: String,
        /// Values to add
        values: Vec<Value>,
    },
    /// Remove values from an array field of an existing document
    ArrayRemove {
        /// Array field name
        field: String,
        /// Values to remove
        values: Vec<Value>,
    },
    /// Atomically add to a numeric field, treating a missing field as zero
    Increment {
        /// Numeric field name
        field: String,
        /// Amount to add
        by: i64,
    },
}

/// A full snapshot of a collection's direct children
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The subscribed collection prefix
    pub prefix: String,
    /// Every direct child as (path, document)
    pub docs: Vec<(String, Document)>,
}

/// A live prefix subscription
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Snapshot>,
}

impl Subscription {
    /// Wait for the next snapshot; `None` once the store is dropped
    pub async fn recv(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    /// Take a snapshot if one is already queued
    pub fn try_recv(&mut self) -> Option<Snapshot> {
        self.rx.try_recv().ok()
    }
}

struct StoredDoc {
    data: Document,
    version: u64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Snapshot>,
}

struct Inner {
    docs: BTreeMap<String, StoredDoc>,
    watchers: Vec<Watcher>,
}

/// In-process remote document store
pub struct RemoteStore {
    clock: Arc<ServerClock>,
    inner: Mutex<Inner>,
    online: AtomicBool,
    write_ops: AtomicU64,
}

impl RemoteStore {
    /// Create an empty, online store
    pub fn new() -> Self {
        Self::with_clock(Arc::new(ServerClock::new()))
    }

    /// Create a store sharing an existing clock
    pub fn with_clock(clock: Arc<ServerClock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner {
                docs: BTreeMap::new(),
                watchers: Vec::new(),
            }),
            online: AtomicBool::new(true),
            write_ops: AtomicU64::new(0),
        }
    }

    /// The server clock backing this store
    pub fn clock(&self) -> Arc<ServerClock> {
        Arc::clone(&self.clock)
    }

    /// Total committed write operations; tests use this to assert that a
    /// re-applied snapshot produced zero new writes
    pub fn write_op_count(&self) -> u64 {
        self.write_ops.load(Ordering::SeqCst)
    }

    /// Whether the backend is currently reachable
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Flip connectivity; going online re-delivers a full snapshot to every
    /// watcher
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if online {
            let mut inner = self.lock();
            let prefixes: Vec<String> =
                inner.watchers.iter().map(|w| w.prefix.clone()).collect();
            for prefix in prefixes {
                Self::deliver(&mut inner, &prefix);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn require_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::NetworkUnavailable)
        }
    }

    fn is_direct_child(prefix: &str, path: &str) -> bool {
        path.strip_prefix(prefix)
            .map(|rest| !rest.is_empty() && !rest.contains('/'))
            .unwrap_or(false)
    }

    fn snapshot_of(inner: &Inner, prefix: &str) -> Snapshot {
        let docs = inner
            .docs
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .filter(|(path, _)| Self::is_direct_child(prefix, path))
            .map(|(path, doc)| (path.clone(), doc.data.clone()))
            .collect();
        Snapshot {
            prefix: prefix.to_string(),
            docs,
        }
    }

    fn deliver(inner: &mut Inner, prefix: &str) {
        let snapshot = Self::snapshot_of(inner, prefix);
        inner
            .watchers
            .retain(|w| w.prefix != prefix || w.tx.send(snapshot.clone()).is_ok());
    }

    fn notify_for_path(inner: &mut Inner, path: &str) {
        let prefixes: Vec<String> = inner
            .watchers
            .iter()
            .map(|w| w.prefix.clone())
            .filter(|p| Self::is_direct_child(p, path))
            .collect();
        for prefix in prefixes {
            Self::deliver(inner, &prefix);
        }
    }

    /// Subscribe to the direct children of a collection prefix
    ///
    /// Delivers an initial snapshot immediately when online; while offline
    /// the first snapshot arrives on reconnect.
    pub fn subscribe(&self, prefix: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if self.is_online() {
            let snapshot = Self::snapshot_of(&inner, prefix);
            // Watcher just created, send cannot observe a closed receiver.
            let _ = tx.send(snapshot);
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Subscription { rx }
    }

    fn apply(inner: &mut Inner, path: &str, kind: WriteKind) -> Result<()> {
        match kind {
            WriteKind::Set(data) => {
                let version = inner.docs.get(path).map(|d| d.version + 1).unwrap_or(1);
                inner
                    .docs
                    .insert(path.to_string(), StoredDoc { data, version });
            }
            WriteKind::Merge(data) => {
                let entry = inner.docs.entry(path.to_string()).or_insert(StoredDoc {
                    data: Document::new(),
                    version: 0,
                });
                for (key, value) in data {
                    entry.data.insert(key, value);
                }
                entry.version += 1;
            }
            WriteKind::Update(data) => {
                let entry = inner
                    .docs
                    .get_mut(path)
                    .ok_or_else(|| Error::NotFound(path.to_string()))?;
                for (key, value) in data {
                    entry.data.insert(key, value);
                }
                entry.version += 1;
            }
            WriteKind::Delete => {
                inner.docs.remove(path);
            }
            WriteKind::ArrayUnion { field, values } => {
                let entry = inner.docs.entry(path.to_string()).or_insert(StoredDoc {
                    data: Document::new(),
                    version: 0,
                });
                let array = entry
                    .data
                    .entry(field)
                    .or_insert_with(|| Value::Array(Vec::new()));
                let items = array
                    .as_array_mut()
                    .ok_or_else(|| Error::Storage(format!("Field is not an array at {}", path)))?;
                for value in values {
                    if !items.contains(&value) {
                        items.push(value);
                    }
                }
                entry.version += 1;
            }
            WriteKind::ArrayRemove { field, values } => {
                let entry = inner
                    .docs
                    .get_mut(path)
                    .ok_or_else(|| Error::NotFound(path.to_string()))?;
                if let Some(array) = entry.data.get_mut(&field) {
                    let items = array.as_array_mut().ok_or_else(|| {
                        Error::Storage(format!("Field is not an array at {}", path))
                    })?;
                    items.retain(|v| !values.contains(v));
                }
                entry.version += 1;
            }
            WriteKind::Increment { field, by } => {
                let entry = inner.docs.entry(path.to_string()).or_insert(StoredDoc {
                    data: Document::new(),
                    version: 0,
                });
                let current = entry
                    .data
                    .get(&field)
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                entry
                    .data
                    .insert(field, Value::Number((current + by).into()));
                entry.version += 1;
            }
        }
        Ok(())
    }

    /// Apply a single write and notify matching watchers
    pub async fn write(&self, path: &str, kind: WriteKind) -> Result<()> {
        self.require_online()?;
        let mut inner = self.lock();
        Self::apply(&mut inner, path, kind)?;
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        Self::notify_for_path(&mut inner, path);
        Ok(())
    }

    /// Apply a batch of writes item by item
    ///
    /// Writes are not atomic as a group: each one commits independently and
    /// failures are collected. Successful writes stay applied even when the
    /// batch as a whole reports [`Error::PartialBatchFailure`].
    pub async fn write_batch(&self, writes: Vec<(String, WriteKind)>) -> Result<()> {
        self.require_online()?;
        let mut failed = Vec::new();
        let mut inner = self.lock();
        for (path, kind) in writes {
            match Self::apply(&mut inner, &path, kind) {
                Ok(()) => {
                    self.write_ops.fetch_add(1, Ordering::SeqCst);
                    Self::notify_for_path(&mut inner, &path);
                }
                Err(e) => {
                    debug!(path = %path, error = %e, "Batch write item failed");
                    failed.push(path);
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialBatchFailure { failed })
        }
    }

    /// Read one document
    pub async fn get(&self, path: &str) -> Result<Option<Document>> {
        self.require_online()?;
        Ok(self.lock().docs.get(path).map(|d| d.data.clone()))
    }

    /// List the direct children of a collection prefix
    pub async fn list(&self, prefix: &str) -> Result<Vec<(String, Document)>> {
        self.require_online()?;
        Ok(Self::snapshot_of(&self.lock(), prefix).docs)
    }

    /// Direct children of a prefix whose `field` equals `value`
    pub async fn query_eq(
        &self,
        prefix: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Document)>> {
        let docs = self.list(prefix).await?;
        Ok(docs
            .into_iter()
            .filter(|(_, doc)| doc.get(field) == Some(value))
            .collect())
    }

    /// Documents in any collection named `collection`, across all parents,
    /// whose `field` equals `value`
    ///
    /// The collection name is the second-to-last path segment.
    pub async fn query_collection_group(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Document)>> {
        self.require_online()?;
        let inner = self.lock();
        Ok(inner
            .docs
            .iter()
            .filter(|(path, _)| {
                let mut segments = path.rsplit('/');
                segments.next();
                segments.next() == Some(collection)
            })
            .filter(|(_, doc)| doc.data.get(field) == Some(value))
            .map(|(path, doc)| (path.clone(), doc.data.clone()))
            .collect())
    }

    /// Run a read-mutate-write transaction over a fixed set of paths
    ///
    /// The closure receives the current state of each path (in the order
    /// given) and returns the writes to commit. The commit only lands if no
    /// read document changed in the meantime; otherwise the transaction
    /// retries up to `max_retries` times before giving up with
    /// [`Error::TransactionAborted`].
    pub async fn run_transaction<F>(
        &self,
        read_paths: &[String],
        max_retries: u32,
        mut mutate: F,
    ) -> Result<()>
    where
        F: FnMut(&[Option<Document>]) -> Result<Vec<(String, WriteKind)>>,
    {
        self.require_online()?;
        for _ in 0..=max_retries {
            let (reads, versions): (Vec<Option<Document>>, Vec<Option<u64>>) = {
                let inner = self.lock();
                read_paths
                    .iter()
                    .map(|path| {
                        let doc = inner.docs.get(path.as_str());
                        (doc.map(|d| d.data.clone()), doc.map(|d| d.version))
                    })
                    .unzip()
            };

            let writes = mutate(&reads)?;

            self.require_online()?;
            let mut inner = self.lock();
            let unchanged = read_paths.iter().zip(&versions).all(|(path, version)| {
                inner.docs.get(path.as_str()).map(|d| d.version) == *version
            });
            if !unchanged {
                continue;
            }
            for (path, kind) in writes {
                Self::apply(&mut inner, &path, kind)?;
                self.write_ops.fetch_add(1, Ordering::SeqCst);
                Self::notify_for_path(&mut inner, &path);
            }
            return Ok(());
        }
        Err(Error::TransactionAborted)
    }
}

impl Default for RemoteStore {
    fn default() -> Self {
        Self::new()
    }
}
