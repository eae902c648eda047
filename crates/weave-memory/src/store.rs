use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use weave_core::{WeaveError, WeaveResult};

/// A committed value in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub value: serde_json::Value,
    /// Id of the participant that wrote the value.
    pub author: String,
    /// 1 on first write, +1 on every later write to the same key.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Callback invoked after a write to a subscribed key is committed.
pub trait StateObserver: Send + Sync {
    /// Called with the key and the entry that was just committed.
    fn on_change(&self, key: &str, entry: &StateEntry) -> WeaveResult<()>;
}

impl<F> StateObserver for F
where
    F: Fn(&str, &StateEntry) -> WeaveResult<()> + Send + Sync,
{
    fn on_change(&self, key: &str, entry: &StateEntry) -> WeaveResult<()> {
        self(key, entry)
    }
}

/// Handle returned by [`SharedStateStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

/// Counters reported by [`SharedStateStore::statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStatistics {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub keys: usize,
    pub observers: usize,
}

type Slot = Arc<Mutex<Option<StateEntry>>>;
type ObserverList = Vec<(SubscriptionId, Arc<dyn StateObserver>)>;

/// Versioned key/value store with per-key write exclusion and change observers.
///
/// A file-backed store rewrites its file after every committed write, delete
/// and clear. A failed save is logged and the in-memory state stays
/// authoritative; [`SharedStateStore::flush`] reports the error instead.
///
/// The map lock is only held long enough to find (or create) a key's slot;
/// the write itself happens under that slot's own mutex. Deleted keys keep
/// an empty slot so a concurrent writer never writes into a detached one.
pub struct SharedStateStore {
    slots: RwLock<HashMap<String, Slot>>,
    observers: RwLock<HashMap<String, ObserverList>>,
    path: Option<PathBuf>,
    /// Serialises file writes so an older snapshot never replaces a newer one.
    persist_lock: Mutex<()>,
    next_subscription: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,
}

impl SharedStateStore {
    /// In-memory store with no persistence.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            observers: RwLock::new(HashMap::new()),
            path: None,
            persist_lock: Mutex::new(()),
            next_subscription: AtomicU64::new(1),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
        }
    }

    /// Store backed by a JSON file. Existing contents are loaded; a missing
    /// file starts an empty store (its parent directory is created).
    pub async fn open(path: impl Into<PathBuf>) -> WeaveResult<Self> {
        let path = path.into();
        let mut store = Self::new();

        if tokio::fs::try_exists(&path).await? {
            let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
                WeaveError::State(format!("Failed to read state file {}: {e}", path.display()))
            })?;
            let entries: BTreeMap<String, StateEntry> = if data.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&data).map_err(|e| {
                    WeaveError::State(format!("Invalid state file {}: {e}", path.display()))
                })?
            };
            let count = entries.len();
            {
                let mut slots = store.slots.write();
                for (key, entry) in entries {
                    slots.insert(key, Arc::new(Mutex::new(Some(entry))));
                }
            }
            info!(path = %path.display(), keys = count, "Shared state loaded");
        } else if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    WeaveError::State(format!("Failed to create state dir: {e}"))
                })?;
            }
        }

        store.path = Some(path);
        Ok(store)
    }

    /// File this store persists to, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn slot(&self, key: &str) -> Slot {
        if let Some(slot) = self.slots.read().get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Write `value` under `key` and return the new version.
    pub fn write(&self, key: &str, value: serde_json::Value, author: &str) -> u64 {
        self.write_with_metadata(key, value, author, HashMap::new())
    }

    /// Write with metadata attached to the entry. Observers of `key` are
    /// notified after the key's lock is released.
    pub fn write_with_metadata(
        &self,
        key: &str,
        value: serde_json::Value,
        author: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> u64 {
        let slot = self.slot(key);
        let entry = {
            let mut current = slot.lock();
            let version = current.as_ref().map_or(0, |e| e.version) + 1;
            let entry = StateEntry {
                value,
                author: author.to_string(),
                version,
                timestamp: Utc::now(),
                metadata,
            };
            *current = Some(entry.clone());
            entry
        };
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, author = %author, version = entry.version, "State written");
        self.persist_quietly();

        self.notify(key, &entry);
        entry.version
    }

    fn notify(&self, key: &str, entry: &StateEntry) {
        let observers: ObserverList = match self.observers.read().get(key) {
            Some(list) => list.clone(),
            None => return,
        };

        for (id, observer) in observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_change(key, entry)));
            match outcome {
                Ok(Ok(())) => {
                    self.notifications_sent.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.notifications_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, subscription = id.0, error = %e, "State observer failed");
                }
                Err(_) => {
                    self.notifications_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, subscription = id.0, "State observer panicked");
                }
            }
        }
    }

    /// Latest value under `key`.
    pub fn read(&self, key: &str) -> Option<serde_json::Value> {
        let entry = self.read_entry(key)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Some(entry.value)
    }

    /// Latest full entry under `key`.
    pub fn read_entry(&self, key: &str) -> Option<StateEntry> {
        let slot = self.slots.read().get(key).cloned()?;
        let entry = slot.lock().clone();
        entry
    }

    /// Current version of `key`, 0 when absent.
    pub fn version(&self, key: &str) -> u64 {
        self.read_entry(key).map_or(0, |e| e.version)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.read_entry(key).is_some()
    }

    /// All keys holding a value, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .snapshot()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<(String, StateEntry)> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let entry = slot.lock().clone()?;
                Some((key, entry))
            })
            .collect()
    }

    /// Remove `key` and its observers. A later write starts again at version 1.
    pub fn delete(&self, key: &str) -> bool {
        let Some(slot) = self.slots.read().get(key).cloned() else {
            return false;
        };
        let removed = slot.lock().take().is_some();
        if removed {
            self.observers.write().remove(key);
            self.deletes.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "State deleted");
            self.persist_quietly();
        }
        removed
    }

    /// Values written by `author`, keyed by key.
    pub fn by_author(&self, author: &str) -> BTreeMap<String, serde_json::Value> {
        self.snapshot()
            .into_iter()
            .filter(|(_, entry)| entry.author == author)
            .map(|(key, entry)| (key, entry.value))
            .collect()
    }

    /// The `n` most recently written entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<(String, StateEntry)> {
        let mut entries = self.snapshot();
        entries.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));
        entries.truncate(n);
        entries
    }

    /// Register an observer for `key`.
    pub fn subscribe(&self, key: &str, observer: impl StateObserver + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(observer)));
        debug!(key = %key, subscription = id.0, "State observer subscribed");
        id
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let Some(list) = observers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() < before;
        if list.is_empty() {
            observers.remove(key);
        }
        removed
    }

    /// Drop every key and observer.
    pub fn clear(&self) {
        let slots: Vec<Slot> = self.slots.read().values().cloned().collect();
        for slot in slots {
            slot.lock().take();
        }
        self.observers.write().clear();
        info!("Shared state cleared");
        self.persist_quietly();
    }

    pub fn statistics(&self) -> StateStatistics {
        StateStatistics {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            keys: self.len(),
            observers: self.observers.read().values().map(Vec::len).sum(),
        }
    }

    /// Write every entry to the backing file. A no-op for in-memory stores.
    ///
    /// Committed changes are already saved as they happen; this re-saves and
    /// surfaces any I/O error.
    pub async fn flush(&self) -> WeaveResult<()> {
        self.persist()
    }

    fn persist_quietly(&self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "Failed to save shared state");
        }
    }

    /// The file is written next to its final path and renamed into place, so
    /// readers never see a partial document.
    fn persist(&self) -> WeaveResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self.persist_lock.lock();
        let entries: BTreeMap<String, StateEntry> = self.snapshot().into_iter().collect();
        let json = serde_json::to_string_pretty(&entries)?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| WeaveError::State(format!("Failed to write state file: {e}")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| WeaveError::State(format!("Failed to replace state file: {e}")))?;

        debug!(path = %path.display(), keys = entries.len(), "Shared state saved");
        Ok(())
    }
}

impl Default for SharedStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStateStore")
            .field("keys", &self.len())
            .field("path", &self.path)
            .finish()
    }
}
