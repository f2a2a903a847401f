//! Events attached to job objects.

use std::sync::{Mutex, PoisonError};

use tfop_api::ObjectMeta;
use tracing::{info, warn};

/// Reason used when a stored object cannot be decoded as a job.
pub const FAILED_MARSHAL_REASON: &str = "InvalidTFJobSpec";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Publishes human-readable events against job objects.
pub trait EventRecorder: Send + Sync {
    fn event(&self, meta: &ObjectMeta, event_type: EventType, reason: &str, message: &str);

    fn warning(&self, meta: &ObjectMeta, reason: &str, message: &str) {
        self.event(meta, EventType::Warning, reason, message);
    }
}

/// Recorder that writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn event(&self, meta: &ObjectMeta, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!(
                namespace = %meta.namespace,
                name = %meta.name,
                reason,
                message,
                "Job event"
            ),
            EventType::Warning => warn!(
                namespace = %meta.namespace,
                name = %meta.name,
                reason,
                message,
                "Job event"
            ),
        }
    }
}

/// An event captured by [`MemoryRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub namespace: String,
    pub name: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Recorder that keeps events in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, oldest first.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventRecorder for MemoryRecorder {
    fn event(&self, meta: &ObjectMeta, event_type: EventType, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
                event_type,
                reason: reason.to_string(),
                message: message.to_string(),
            });
    }
}
