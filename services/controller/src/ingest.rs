//! Event ingestion.
//!
//! Turns store notifications into work queue keys. Handlers never block and
//! never fail: an object without a usable key is logged and dropped.

use serde_json::Value;
use tfop_id::{JobKey, KeyError};
use tfop_reconcile::WorkQueue;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::store::{object_namespace_name, DeletedObject, JobNotification};

/// Compute the queue key of a raw job object.
pub fn key_for_object(obj: &Value) -> Result<JobKey, KeyError> {
    let (namespace, name) = object_namespace_name(obj);
    JobKey::new(namespace, name)
}

/// Compute the queue key carried by a delete notification.
///
/// Tombstones carry their key directly; the last known object is consulted
/// only when that key does not parse.
pub fn key_for_deleted(deleted: &DeletedObject) -> Result<JobKey, KeyError> {
    match deleted {
        DeletedObject::Object(obj) => key_for_object(obj),
        DeletedObject::FinalStateUnknown { key, last_known } => {
            JobKey::parse(key).or_else(|e| match last_known {
                Some(obj) => key_for_object(obj),
                None => Err(e),
            })
        }
    }
}

/// Enqueues job keys for store notifications.
#[derive(Clone)]
pub struct EventHandler {
    queue: WorkQueue<String>,
}

impl EventHandler {
    pub fn new(queue: WorkQueue<String>) -> Self {
        Self { queue }
    }

    /// Dispatch one notification.
    pub fn handle(&self, notification: JobNotification) {
        match notification {
            JobNotification::Added(obj) => self.on_add(&obj),
            JobNotification::Updated { old, new } => self.on_update(&old, &new),
            JobNotification::Deleted(deleted) => self.on_delete(&deleted),
        }
    }

    pub fn on_add(&self, obj: &Value) {
        self.enqueue("add", key_for_object(obj));
    }

    /// Every update is enqueued, including resyncs that changed nothing.
    pub fn on_update(&self, old: &Value, new: &Value) {
        debug!(
            old_version = resource_version(old),
            new_version = resource_version(new),
            "Job updated"
        );
        self.enqueue("update", key_for_object(new));
    }

    pub fn on_delete(&self, deleted: &DeletedObject) {
        self.enqueue("delete", key_for_deleted(deleted));
    }

    fn enqueue(&self, event: &'static str, key: Result<JobKey, KeyError>) {
        match key {
            Ok(key) => {
                debug!(event, job = %key, "Enqueueing job");
                self.queue.add(key.to_string());
            }
            Err(e) => {
                warn!(event, error = %e, "Couldn't get key for object, dropping notification");
            }
        }
    }
}

fn resource_version(obj: &Value) -> &str {
    obj.get("metadata")
        .and_then(|m| m.get("resourceVersion"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// Feed notifications to `handler` until shutdown or the stream ends.
pub async fn run_ingest(
    handler: EventHandler,
    mut notifications: mpsc::UnboundedReceiver<JobNotification>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            notification = notifications.recv() => match notification {
                Some(notification) => handler.handle(notification),
                None => {
                    info!("Job notification stream closed");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Event ingestion stopped");
}
