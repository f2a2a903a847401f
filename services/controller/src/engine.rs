//! Reconciliation engine seam.
//!
//! The engine drives a job's pods and services toward its spec. The sync
//! engine hands it a private, defaulted copy of the job together with the
//! replica specs, status and run policy extracted from that copy.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tfop_api::{
    JobStatus, ReplicaSpecSet, ReplicaType, RunPolicy, TrainingJob, GROUP_NAME, GROUP_NAME_LABEL,
    JOB_NAME_LABEL, REPLICA_INDEX_LABEL, REPLICA_TYPE_LABEL,
};
use tfop_reconcile::ReplicaRole;
use thiserror::Error;
use tracing::{debug, info};

/// Label marking the master replica's pods.
pub const JOB_ROLE_LABEL: &str = "job-role";

/// Errors returned by a reconciliation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A write lost a race with another writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The cluster refused to create more resources.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The cluster API could not be reached.
    #[error("api unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Drives a job's subordinate resources toward its spec.
#[async_trait]
pub trait ReconcileEngine: Send + Sync {
    async fn reconcile_jobs(
        &self,
        job: TrainingJob,
        replicas: ReplicaSpecSet,
        status: JobStatus,
        run_policy: RunPolicy,
    ) -> Result<(), EngineError>;
}

/// Labels stamped onto the pod and service of one replica.
pub fn replica_labels(
    job_name: &str,
    replicas: &ReplicaSpecSet,
    replica_type: ReplicaType,
    index: usize,
) -> BTreeMap<String, String> {
    let role = ReplicaRole::resolve(replicas, replica_type, index);

    let mut labels = BTreeMap::new();
    labels.insert(GROUP_NAME_LABEL.to_string(), GROUP_NAME.to_string());
    labels.insert(JOB_NAME_LABEL.to_string(), job_name.to_string());
    labels.insert(REPLICA_TYPE_LABEL.to_string(), replica_type.label_value());
    labels.insert(REPLICA_INDEX_LABEL.to_string(), index.to_string());
    if role.is_master {
        labels.insert(JOB_ROLE_LABEL.to_string(), "master".to_string());
    }
    labels
}

/// Engine that plans replicas and logs them instead of touching a cluster.
#[derive(Debug, Default, Clone)]
pub struct LoggingEngine {
    gang_scheduling: bool,
}

impl LoggingEngine {
    pub fn new(gang_scheduling: bool) -> Self {
        Self { gang_scheduling }
    }
}

#[async_trait]
impl ReconcileEngine for LoggingEngine {
    async fn reconcile_jobs(
        &self,
        mut job: TrainingJob,
        replicas: ReplicaSpecSet,
        status: JobStatus,
        run_policy: RunPolicy,
    ) -> Result<(), EngineError> {
        let total: i32 = replicas.values().map(|s| s.replicas.unwrap_or(0)).sum();
        info!(
            namespace = %job.metadata.namespace,
            name = %job.metadata.name,
            replica_types = replicas.len(),
            total_replicas = total,
            clean_pod_policy = ?run_policy.clean_pod_policy,
            conditions = status.conditions.len(),
            gang_scheduling = self.gang_scheduling,
            "Reconciling job"
        );

        for (replica_type, spec) in &replicas {
            let count = usize::try_from(spec.replicas.unwrap_or(0)).unwrap_or(0);
            for index in 0..count {
                let labels = replica_labels(&job.metadata.name, &replicas, *replica_type, index);
                debug!(
                    replica_type = %replica_type,
                    index,
                    master = labels.contains_key(JOB_ROLE_LABEL),
                    ?labels,
                    "Planned replica"
                );
            }
        }

        // Only the private copy changes; status writes belong to a real engine.
        job.status.last_reconcile_time = Some(Utc::now());
        debug!(last_reconcile_time = ?job.status.last_reconcile_time, "Reconcile pass complete");
        Ok(())
    }
}
