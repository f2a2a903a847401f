//! Typed, owned views of jobs read from the store.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tfop_api::{ObjectMeta, TrainingJob};
use tfop_id::JobKey;
use thiserror::Error;
use tracing::debug;

use crate::store::{JobStore, StoreError};

/// Errors returned by the snapshot accessor.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The store could not be read.
    #[error("failed to read job {key}: {source}")]
    Store {
        key: JobKey,
        #[source]
        source: StoreError,
    },

    /// The stored object is not a valid job.
    ///
    /// `metadata` is present when at least the object's metadata decoded, so
    /// an event can still be attached to it.
    #[error("failed to unmarshal the object to job {key}: {source}")]
    Decode {
        key: JobKey,
        metadata: Option<Box<ObjectMeta>>,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of a successful lookup.
#[derive(Debug)]
pub enum Lookup {
    Found(JobSnapshot),

    /// The job no longer exists.
    Gone,
}

/// A decoded job owned by the caller.
///
/// Decoding builds a new value, so nothing done to a snapshot is visible
/// through the store or to other snapshots of the same job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot(TrainingJob);

impl JobSnapshot {
    pub fn job(&self) -> &TrainingJob {
        &self.0
    }

    pub fn into_job(self) -> TrainingJob {
        self.0
    }
}

#[derive(Deserialize)]
struct MetadataOnly {
    metadata: ObjectMeta,
}

/// Reads jobs from the store and decodes them.
#[derive(Clone)]
pub struct SnapshotAccessor {
    store: Arc<dyn JobStore>,
}

impl SnapshotAccessor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Look up a job in the local cache.
    pub async fn lookup(&self, key: &JobKey) -> Result<Lookup, SnapshotError> {
        let raw = self
            .store
            .get_cached(key.namespace(), key.name())
            .await
            .map_err(|source| SnapshotError::Store {
                key: key.clone(),
                source,
            })?;
        decode(key, raw)
    }

    /// Look up a job in the authoritative store, bypassing the cache.
    pub async fn lookup_live(&self, key: &JobKey) -> Result<Lookup, SnapshotError> {
        let raw = self
            .store
            .get_live(key.namespace(), key.name())
            .await
            .map_err(|source| SnapshotError::Store {
                key: key.clone(),
                source,
            })?;
        decode(key, raw)
    }
}

fn decode(key: &JobKey, raw: Option<Value>) -> Result<Lookup, SnapshotError> {
    let Some(raw) = raw else {
        debug!(job = %key, "Job not found in store");
        return Ok(Lookup::Gone);
    };

    match TrainingJob::deserialize(&raw) {
        Ok(job) => Ok(Lookup::Found(JobSnapshot(job))),
        Err(source) => {
            let metadata = MetadataOnly::deserialize(&raw)
                .ok()
                .map(|m| Box::new(m.metadata));
            Err(SnapshotError::Decode {
                key: key.clone(),
                metadata,
                source,
            })
        }
    }
}
