//! Outstanding create/delete expectations.
//!
//! When the reconciliation engine issues creates or deletes for a job's
//! pods and services it records how many it expects to observe back
//! through the cache. Until those observations arrive, re-syncing the job
//! would act on stale state and duplicate work, so the sync engine skips it.
//!
//! Records are keyed per job, per replica type, per resource kind:
//! `{namespace}/{name}/{replica type}/pods` and `.../services`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tfop_api::ReplicaType;
use tfop_id::JobKey;
use thiserror::Error;
use tracing::debug;

/// How long a record may stay unfulfilled before it is considered stale.
pub const DEFAULT_EXPECTATIONS_TTL: Duration = Duration::from_secs(5 * 60);

/// Errors raised by an expectation tracker.
#[derive(Debug, Error)]
pub enum ExpectationError {
    /// The tracker's state cannot be read.
    #[error("expectations unavailable: {0}")]
    Unavailable(String),
}

/// Capability consumed by the sync engine.
pub trait ExpectationTracker: Send + Sync {
    /// True iff no expected creates or deletes remain outstanding for any of
    /// `replica_types` of the job.
    fn satisfied(
        &self,
        job_key: &JobKey,
        replica_types: &[ReplicaType],
    ) -> Result<bool, ExpectationError>;
}

/// Expectation key for a replica type's pods.
pub fn pods_key(job_key: &JobKey, replica_type: ReplicaType) -> String {
    format!("{}/{}/pods", job_key, replica_type.label_value())
}

/// Expectation key for a replica type's services.
pub fn services_key(job_key: &JobKey, replica_type: ReplicaType) -> String {
    format!("{}/{}/services", job_key, replica_type.label_value())
}

#[derive(Debug, Clone, Copy)]
struct Expectee {
    add: i64,
    del: i64,
    timestamp: Instant,
}

impl Expectee {
    fn fulfilled(&self) -> bool {
        self.add <= 0 && self.del <= 0
    }
}

/// In-memory expectation tracker.
#[derive(Debug)]
pub struct ControllerExpectations {
    records: RwLock<HashMap<String, Expectee>>,
    ttl: Duration,
}

impl Default for ControllerExpectations {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerExpectations {
    /// Create a tracker with the default TTL.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_EXPECTATIONS_TTL)
    }

    /// Create a tracker whose unfulfilled records expire after `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Replace the record for `key`.
    pub fn set_expectations(&self, key: &str, add: i64, del: i64) -> Result<(), ExpectationError> {
        let mut records = self.write()?;
        records.insert(
            key.to_string(),
            Expectee {
                add,
                del,
                timestamp: Instant::now(),
            },
        );
        Ok(())
    }

    /// Expect `adds` creations for `key`.
    pub fn expect_creations(&self, key: &str, adds: i64) -> Result<(), ExpectationError> {
        self.set_expectations(key, adds, 0)
    }

    /// Expect `dels` deletions for `key`.
    pub fn expect_deletions(&self, key: &str, dels: i64) -> Result<(), ExpectationError> {
        self.set_expectations(key, 0, dels)
    }

    /// Increase the outstanding counts for an existing record.
    pub fn raise(&self, key: &str, add: i64, del: i64) -> Result<(), ExpectationError> {
        self.adjust(key, add, del)
    }

    /// Decrease the outstanding counts for an existing record.
    pub fn lower(&self, key: &str, add: i64, del: i64) -> Result<(), ExpectationError> {
        self.adjust(key, -add, -del)
    }

    /// Record one observed creation.
    pub fn creation_observed(&self, key: &str) -> Result<(), ExpectationError> {
        self.lower(key, 1, 0)
    }

    /// Record one observed deletion.
    pub fn deletion_observed(&self, key: &str) -> Result<(), ExpectationError> {
        self.lower(key, 0, 1)
    }

    /// Drop the record for `key`.
    pub fn delete_expectations(&self, key: &str) -> Result<(), ExpectationError> {
        self.write()?.remove(key);
        Ok(())
    }

    /// Outstanding `(add, del)` counts for `key`, if a record exists.
    pub fn get(&self, key: &str) -> Result<Option<(i64, i64)>, ExpectationError> {
        Ok(self.read()?.get(key).map(|e| (e.add, e.del)))
    }

    /// True if the record for `key` is fulfilled, expired, or absent.
    pub fn satisfied_expectations(&self, key: &str) -> Result<bool, ExpectationError> {
        let records = self.read()?;
        let Some(expectee) = records.get(key) else {
            // No record: either never set or already cleaned up.
            return Ok(true);
        };

        if expectee.fulfilled() {
            return Ok(true);
        }
        if expectee.timestamp.elapsed() > self.ttl {
            debug!(key, "Expectations expired");
            return Ok(true);
        }

        debug!(
            key,
            add = expectee.add,
            del = expectee.del,
            "Controller still waiting on expectations"
        );
        Ok(false)
    }

    fn adjust(&self, key: &str, add: i64, del: i64) -> Result<(), ExpectationError> {
        let mut records = self.write()?;
        if let Some(expectee) = records.get_mut(key) {
            expectee.add += add;
            expectee.del += del;
        }
        Ok(())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Expectee>>, ExpectationError> {
        self.records
            .read()
            .map_err(|e| ExpectationError::Unavailable(e.to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Expectee>>, ExpectationError> {
        self.records
            .write()
            .map_err(|e| ExpectationError::Unavailable(e.to_string()))
    }
}

impl ExpectationTracker for ControllerExpectations {
    fn satisfied(
        &self,
        job_key: &JobKey,
        replica_types: &[ReplicaType],
    ) -> Result<bool, ExpectationError> {
        for replica_type in replica_types {
            if !self.satisfied_expectations(&pods_key(job_key, *replica_type))?
                || !self.satisfied_expectations(&services_key(job_key, *replica_type))?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
