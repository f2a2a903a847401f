//! Controller lifecycle and worker pool.
//!
//! `run` wires store notifications into the work queue, waits for the cache
//! to sync, then runs a fixed number of workers until shutdown. Each worker
//! takes one key at a time and hands it to the sync engine; the queue
//! guarantees a key is never held by two workers at once.

use std::sync::Arc;
use std::time::Duration;

use tfop_id::JobKey;
use tfop_reconcile::{BackoffPolicy, ExpectationTracker, WorkQueue};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::engine::ReconcileEngine;
use crate::ingest::{run_ingest, EventHandler};
use crate::metrics::JobMetrics;
use crate::recorder::EventRecorder;
use crate::snapshot::SnapshotAccessor;
use crate::store::{wait_for_cache_sync, JobStore};
use crate::sync::JobSyncer;

/// Name of the controller's work queue.
pub const QUEUE_NAME: &str = "tfjob";

/// Errors that stop the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to wait for caches to sync")]
    CacheSync,

    #[error("threadiness must be at least 1")]
    InvalidThreadiness,
}

/// Tunables for the controller loop.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub backoff: BackoffPolicy,
    pub cache_sync_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            cache_sync_timeout: Duration::from_secs(60),
        }
    }
}

/// External capabilities the controller drives.
pub struct Collaborators {
    pub store: Arc<dyn JobStore>,
    pub engine: Arc<dyn ReconcileEngine>,
    pub expectations: Arc<dyn ExpectationTracker>,
    pub recorder: Arc<dyn EventRecorder>,
    pub metrics: Arc<dyn JobMetrics>,
}

/// The training-job controller.
pub struct Controller {
    queue: WorkQueue<String>,
    syncer: JobSyncer,
    store: Arc<dyn JobStore>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(collaborators: Collaborators, config: ControllerConfig) -> Self {
        let Collaborators {
            store,
            engine,
            expectations,
            recorder,
            metrics,
        } = collaborators;

        let syncer = JobSyncer::new(
            SnapshotAccessor::new(Arc::clone(&store)),
            expectations,
            engine,
            recorder,
            metrics,
        );

        Self {
            queue: WorkQueue::new(QUEUE_NAME, config.backoff),
            syncer,
            store,
            config,
        }
    }

    /// The controller's work queue.
    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// A handler that feeds notifications into this controller's queue.
    pub fn event_handler(&self) -> EventHandler {
        EventHandler::new(self.queue.clone())
    }

    /// Request a sync of `key`.
    pub fn enqueue(&self, key: &JobKey) {
        self.queue.add(key.to_string());
    }

    /// Run until `shutdown` fires.
    ///
    /// Returns once every worker has finished its current key. Keys still
    /// waiting in the queue at shutdown are discarded.
    pub async fn run(
        self: Arc<Self>,
        threadiness: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        if threadiness == 0 {
            return Err(ControllerError::InvalidThreadiness);
        }

        info!("Starting TFJob controller");
        let ingest = tokio::spawn(run_ingest(
            self.event_handler(),
            self.store.subscribe(),
            shutdown.clone(),
        ));

        info!("Waiting for informer caches to sync");
        if !wait_for_cache_sync(
            self.store.as_ref(),
            &mut shutdown,
            self.config.cache_sync_timeout,
        )
        .await
        {
            error!("Failed to wait for caches to sync");
            ingest.abort();
            self.queue.shut_down();
            return Err(ControllerError::CacheSync);
        }

        info!(threadiness, "Starting workers");
        let mut workers = JoinSet::new();
        for worker in 0..threadiness {
            let controller = Arc::clone(&self);
            workers.spawn(async move { controller.run_worker(worker).await });
        }
        info!("Started workers");

        wait_for_shutdown(&mut shutdown).await;
        info!("Shutting down workers");
        self.queue.shut_down_with_drain().await;
        debug!("In-flight keys drained");

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }

        if let Err(e) = ingest.await {
            warn!(error = %e, "Event ingestion task failed");
        }

        info!("Controller stopped");
        Ok(())
    }

    async fn run_worker(&self, worker: usize) {
        debug!(worker, "Worker started");
        while self.process_next_work_item().await {}
        debug!(worker, "Worker stopped");
    }

    /// Take one key from the queue and sync it.
    ///
    /// Returns false once the queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.syncer.sync_job(&key).await {
            Ok(outcome) => {
                debug!(job = %key, ?outcome, "Synced job");
                self.queue.forget(&key);
            }
            Err(e) if !e.is_retryable() => {
                error!(job = %key, error = %e, "Dropping job key that can never sync");
                self.queue.forget(&key);
            }
            Err(e) => {
                error!(
                    job = %key,
                    error = %e,
                    requeues = self.queue.num_requeues(&key),
                    "Error syncing job, requeueing"
                );
                self.queue.add_rate_limited(key.clone());
            }
        }

        self.queue.done(&key);
        true
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
