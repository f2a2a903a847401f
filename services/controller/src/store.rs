//! Job store collaborator.
//!
//! The store is the controller's window onto the cluster: a local cache of
//! job objects kept current by a watch, an authoritative read path, and a
//! stream of add/update/delete notifications. Objects are raw JSON; typing
//! them is the snapshot accessor's job.
//!
//! [`MemoryJobStore`] is an in-process implementation used by the
//! development binary and by tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// How often cache sync is polled during startup.
const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors from the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The object cannot be stored.
    #[error("invalid object: {0}")]
    InvalidObject(String),
}

/// A change observed on a job object.
#[derive(Debug, Clone)]
pub enum JobNotification {
    Added(Value),
    Updated { old: Value, new: Value },
    Deleted(DeletedObject),
}

/// Payload of a delete notification.
#[derive(Debug, Clone)]
pub enum DeletedObject {
    /// The object as last seen before deletion.
    Object(Value),

    /// The delete was missed; only the last known key is certain.
    FinalStateUnknown {
        key: String,
        last_known: Option<Value>,
    },
}

/// Cache, authoritative reads and change notifications for job objects.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Read a job from the local cache.
    async fn get_cached(&self, namespace: &str, name: &str) -> Result<Option<Value>, StoreError>;

    /// Read a job from the authoritative store, bypassing the cache.
    async fn get_live(&self, namespace: &str, name: &str) -> Result<Option<Value>, StoreError>;

    /// Returns true once the cache holds a complete initial listing.
    fn has_synced(&self) -> bool;

    /// Subscribe to notifications.
    ///
    /// Every object currently cached is replayed as `Added` first.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<JobNotification>;
}

/// Block until the store has synced, the timeout elapses, or shutdown fires.
///
/// Returns true only if the store synced.
pub async fn wait_for_cache_sync(
    store: &dyn JobStore,
    shutdown: &mut watch::Receiver<bool>,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut poll = tokio::time::interval(CACHE_SYNC_POLL_INTERVAL);

    loop {
        if store.has_synced() {
            return true;
        }
        if *shutdown.borrow() {
            return false;
        }

        tokio::select! {
            _ = poll.tick() => {}
            _ = tokio::time::sleep_until(deadline) => {
                return store.has_synced();
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Read `metadata.namespace` and `metadata.name` from a raw object.
pub fn object_namespace_name(obj: &Value) -> (&str, &str) {
    let metadata = obj.get("metadata");
    let field = |name: &str| {
        metadata
            .and_then(|m| m.get(name))
            .and_then(Value::as_str)
            .unwrap_or_default()
    };
    (field("namespace"), field("name"))
}

/// In-memory job store.
pub struct MemoryJobStore {
    objects: RwLock<BTreeMap<String, Value>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<JobNotification>>>,
    resource_version: AtomicU64,
    synced: AtomicBool,
    unavailable: AtomicBool,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    /// Create an empty store that reports itself as synced.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            subscribers: Mutex::new(Vec::new()),
            resource_version: AtomicU64::new(0),
            synced: AtomicBool::new(true),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Create an empty store that has not synced yet.
    pub fn unsynced() -> Self {
        let store = Self::new();
        store.set_synced(false);
        store
    }

    /// Set whether the cache reports itself synced.
    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    /// Make reads fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Create or replace an object, notifying subscribers.
    ///
    /// The stored copy gets a fresh `metadata.resourceVersion`.
    pub fn apply(&self, mut obj: Value) -> Result<(), StoreError> {
        let key = match object_namespace_name(&obj) {
            (namespace, name) if !namespace.is_empty() && !name.is_empty() => {
                format!("{namespace}/{name}")
            }
            _ => {
                return Err(StoreError::InvalidObject(
                    "metadata.namespace and metadata.name are required".to_string(),
                ))
            }
        };

        let version = self.resource_version.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(metadata) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert(
                "resourceVersion".to_string(),
                Value::String(version.to_string()),
            );
        }

        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let notification = match objects.insert(key.clone(), obj.clone()) {
            Some(old) => JobNotification::Updated { old, new: obj },
            None => JobNotification::Added(obj),
        };
        debug!(key = %key, resource_version = version, "Stored job object");
        self.notify(notification);
        Ok(())
    }

    /// Remove an object, notifying subscribers. Returns the removed object.
    pub fn delete(&self, namespace: &str, name: &str) -> Option<Value> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let removed = objects.remove(&format!("{namespace}/{name}"))?;
        self.notify(JobNotification::Deleted(DeletedObject::Object(removed.clone())));
        Some(removed)
    }

    /// Remove an object as if its delete had been missed by the watch.
    pub fn delete_unobserved(&self, namespace: &str, name: &str) -> Option<Value> {
        let key = format!("{namespace}/{name}");
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let removed = objects.remove(&key)?;
        self.notify(JobNotification::Deleted(DeletedObject::FinalStateUnknown {
            key,
            last_known: Some(removed.clone()),
        }));
        Some(removed)
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no objects are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, namespace: &str, name: &str) -> Result<Option<Value>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.get(&format!("{namespace}/{name}")).cloned())
    }

    fn notify(&self, notification: JobNotification) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get_cached(&self, namespace: &str, name: &str) -> Result<Option<Value>, StoreError> {
        self.read(namespace, name)
    }

    async fn get_live(&self, namespace: &str, name: &str) -> Result<Option<Value>, StoreError> {
        self.read(namespace, name)
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<JobNotification> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Hold the object lock so no change slips between replay and registration.
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        for obj in objects.values() {
            let _ = tx.send(JobNotification::Added(obj.clone()));
        }
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);

        info!(replayed = objects.len(), "New job store subscriber");
        rx
    }
}
