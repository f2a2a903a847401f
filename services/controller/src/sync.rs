//! Sync engine: one pass of reconciliation for one job key.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use tfop_api::{set_defaults, ReplicaType};
use tfop_id::{JobKey, KeyError};
use tfop_reconcile::{replica_types, ExpectationTracker};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{EngineError, ReconcileEngine};
use crate::metrics::JobMetrics;
use crate::recorder::{EventRecorder, FAILED_MARSHAL_REASON};
use crate::snapshot::{Lookup, SnapshotAccessor, SnapshotError};

/// How a successful sync ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The engine ran.
    Reconciled,

    /// Outstanding expectations; a later notification will trigger the job.
    Skipped,

    /// The job carries a deletion timestamp.
    Terminating,

    /// The job no longer exists.
    Deleted,
}

/// Why a sync failed.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The key can never sync.
    #[error("invalid job key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error(transparent)]
    Lookup(#[from] SnapshotError),

    #[error("error syncing job: {0}")]
    Reconcile(#[from] EngineError),

    #[error("sync panicked: {0}")]
    Panicked(String),
}

impl SyncError {
    /// Whether the key should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::InvalidKey(_))
    }
}

/// Runs single reconciliation passes.
pub struct JobSyncer {
    snapshots: SnapshotAccessor,
    expectations: Arc<dyn ExpectationTracker>,
    engine: Arc<dyn ReconcileEngine>,
    recorder: Arc<dyn EventRecorder>,
    metrics: Arc<dyn JobMetrics>,
}

impl JobSyncer {
    pub fn new(
        snapshots: SnapshotAccessor,
        expectations: Arc<dyn ExpectationTracker>,
        engine: Arc<dyn ReconcileEngine>,
        recorder: Arc<dyn EventRecorder>,
        metrics: Arc<dyn JobMetrics>,
    ) -> Self {
        Self {
            snapshots,
            expectations,
            engine,
            recorder,
            metrics,
        }
    }

    /// Sync the job identified by `key`.
    ///
    /// Reads a snapshot from the cache, applies defaults to it, and invokes
    /// the engine unless the job is terminating or still has outstanding
    /// expectations.
    ///
    /// A panic from any collaborator during the pass is returned as
    /// [`SyncError::Panicked`].
    #[instrument(skip_all, fields(job = %key))]
    pub async fn sync_job(&self, key: &str) -> Result<SyncOutcome, SyncError> {
        let started = Instant::now();
        let result = match AssertUnwindSafe(self.sync(key)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Sync panicked");
                Err(SyncError::Panicked(message))
            }
        };
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished syncing job"
        );
        result
    }

    async fn sync(&self, key: &str) -> Result<SyncOutcome, SyncError> {
        let key = JobKey::parse(key)?;

        let lookup = match self.snapshots.lookup(&key).await {
            // The cache may lag a recreate; confirm before counting a deletion.
            Ok(Lookup::Gone) => self.snapshots.lookup_live(&key).await,
            other => other,
        };

        let snapshot = match lookup {
            Ok(Lookup::Found(snapshot)) => snapshot,
            Ok(Lookup::Gone) => {
                info!("Job has been deleted");
                self.metrics.job_deleted(key.namespace());
                return Ok(SyncOutcome::Deleted);
            }
            Err(e) => {
                if let SnapshotError::Decode {
                    metadata: Some(meta),
                    ..
                } = &e
                {
                    let message = format!("Failed to unmarshal the object to job: {e}");
                    warn!(error = %e, "Failed to decode job");
                    self.recorder.warning(meta, FAILED_MARSHAL_REASON, &message);
                }
                return Err(e.into());
            }
        };

        let mut job = snapshot.into_job();
        let types = replica_types(&job.spec.replica_specs);
        let needs_sync = job.spec.enable_dynamic_worker
            || self.expectations_satisfied(&key, &types);

        set_defaults(&mut job);

        if job.is_being_deleted() {
            debug!("Job is being deleted, skipping reconciliation");
            return Ok(SyncOutcome::Terminating);
        }
        if !needs_sync {
            debug!("Expectations not yet satisfied, skipping reconciliation");
            return Ok(SyncOutcome::Skipped);
        }

        let replicas = job.spec.replica_specs.clone();
        let status = job.status.clone();
        let run_policy = job.spec.run_policy.clone();

        self.engine
            .reconcile_jobs(job, replicas, status, run_policy)
            .await?;
        Ok(SyncOutcome::Reconciled)
    }

    /// A failing or panicking tracker counts as unsatisfied.
    fn expectations_satisfied(&self, key: &JobKey, replica_types: &[ReplicaType]) -> bool {
        match catch_unwind(AssertUnwindSafe(|| {
            self.expectations.satisfied(key, replica_types)
        })) {
            Ok(Ok(satisfied)) => satisfied,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to check expectations, treating as unsatisfied");
                false
            }
            Err(panic) => {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    "Expectation tracker panicked, treating as unsatisfied"
                );
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
