//! Controller metrics.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Counter of jobs observed deleted, labelled by namespace.
pub const JOBS_DELETED_TOTAL: &str = "tf_operator_jobs_deleted_total";

/// Label carrying the deleted job's namespace.
pub const JOB_NAMESPACE_LABEL: &str = "job_namespace";

/// Metrics emitted by the sync engine.
pub trait JobMetrics: Send + Sync {
    /// A job was found to no longer exist.
    fn job_deleted(&self, namespace: &str);
}

/// Emits through the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl JobMetrics for PrometheusMetrics {
    fn job_deleted(&self, namespace: &str) {
        counter!(JOBS_DELETED_TOTAL, 1u64, JOB_NAMESPACE_LABEL => namespace.to_string());
    }
}

/// Serve Prometheus metrics on `addr` and register metric descriptions.
pub fn install_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    describe_counter!(JOBS_DELETED_TOTAL, "Counts number of TF jobs deleted");
    info!(addr = %addr, "Prometheus metrics exporter listening");
    Ok(())
}

/// In-memory per-namespace counters.
#[derive(Debug, Default)]
pub struct NamespaceCounters {
    deleted: Mutex<HashMap<String, u64>>,
}

impl NamespaceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletions counted for `namespace`.
    pub fn deleted(&self, namespace: &str) -> u64 {
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .copied()
            .unwrap_or(0)
    }
}

impl JobMetrics for NamespaceCounters {
    fn job_deleted(&self, namespace: &str) {
        *self
            .deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace.to_string())
            .or_insert(0) += 1;
    }
}
