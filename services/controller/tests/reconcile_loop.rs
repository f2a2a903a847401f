//! End-to-end behaviour of the controller loop against in-memory collaborators.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tfop_api::{JobStatus, ReplicaSpecSet, ReplicaType, RunPolicy, TrainingJob};
use tfop_controller::metrics::NamespaceCounters;
use tfop_controller::recorder::{EventType, MemoryRecorder, FAILED_MARSHAL_REASON};
use tfop_controller::store::{JobNotification, JobStore, StoreError};
use tfop_controller::{
    Collaborators, Controller, ControllerConfig, ControllerError, EngineError, MemoryJobStore,
    ReconcileEngine,
};
use tfop_id::JobKey;
use tfop_reconcile::{BackoffPolicy, ExpectationError, ExpectationTracker};
use tokio::sync::{mpsc, watch};

// =============================================================================
// Test doubles
// =============================================================================

#[derive(Default)]
struct ScriptedEngine {
    calls: Mutex<Vec<String>>,
    in_flight: Mutex<HashSet<String>>,
    overlapped: AtomicBool,
    failures_left: AtomicU32,
    panics_left: AtomicU32,
    delay: Duration,
}

impl ScriptedEngine {
    fn failing(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
            ..Default::default()
        }
    }

    fn panicking(times: u32) -> Self {
        Self {
            panics_left: AtomicU32::new(times),
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ReconcileEngine for ScriptedEngine {
    async fn reconcile_jobs(
        &self,
        job: TrainingJob,
        _replicas: ReplicaSpecSet,
        _status: JobStatus,
        _run_policy: RunPolicy,
    ) -> Result<(), EngineError> {
        let key = format!("{}/{}", job.metadata.namespace, job.metadata.name);

        if !self.in_flight.lock().unwrap().insert(key.clone()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.lock().unwrap().remove(&key);
        self.calls.lock().unwrap().push(key);

        if Self::take(&self.panics_left) {
            panic!("engine exploded");
        }
        if Self::take(&self.failures_left) {
            return Err(EngineError::Conflict("object was modified".to_string()));
        }
        Ok(())
    }
}

struct FixedExpectations(bool);

impl ExpectationTracker for FixedExpectations {
    fn satisfied(&self, _: &JobKey, _: &[ReplicaType]) -> Result<bool, ExpectationError> {
        Ok(self.0)
    }
}

struct FailingExpectations;

impl ExpectationTracker for FailingExpectations {
    fn satisfied(&self, _: &JobKey, _: &[ReplicaType]) -> Result<bool, ExpectationError> {
        Err(ExpectationError::Unavailable("tracker offline".to_string()))
    }
}

struct PanickingExpectations;

impl ExpectationTracker for PanickingExpectations {
    fn satisfied(&self, _: &JobKey, _: &[ReplicaType]) -> Result<bool, ExpectationError> {
        panic!("tracker exploded")
    }
}

/// Store whose cache can panic once for a key or miss keys entirely.
struct ScriptedStore {
    inner: MemoryJobStore,
    panic_once: Mutex<Option<String>>,
    stale: Mutex<HashSet<String>>,
}

impl ScriptedStore {
    fn new() -> Self {
        Self {
            inner: MemoryJobStore::new(),
            panic_once: Mutex::new(None),
            stale: Mutex::new(HashSet::new()),
        }
    }

    fn panic_once_on(&self, key: &str) {
        *self.panic_once.lock().unwrap() = Some(key.to_string());
    }

    fn hide_from_cache(&self, key: &str) {
        self.stale.lock().unwrap().insert(key.to_string());
    }
}

#[async_trait]
impl JobStore for ScriptedStore {
    async fn get_cached(&self, namespace: &str, name: &str) -> Result<Option<Value>, StoreError> {
        let key = format!("{namespace}/{name}");
        let armed = {
            let mut panic_once = self.panic_once.lock().unwrap();
            if panic_once.as_deref() == Some(key.as_str()) {
                panic_once.take();
                true
            } else {
                false
            }
        };
        if armed {
            panic!("cache read exploded");
        }
        if self.stale.lock().unwrap().contains(&key) {
            return Ok(None);
        }
        self.inner.get_cached(namespace, name).await
    }

    async fn get_live(&self, namespace: &str, name: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get_live(namespace, name).await
    }

    fn has_synced(&self) -> bool {
        self.inner.has_synced()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<JobNotification> {
        self.inner.subscribe()
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    controller: Arc<Controller>,
    store: Arc<MemoryJobStore>,
    engine: Arc<ScriptedEngine>,
    recorder: Arc<MemoryRecorder>,
    counters: Arc<NamespaceCounters>,
}

impl Harness {
    fn new(engine: ScriptedEngine) -> Self {
        Self::build(
            MemoryJobStore::new(),
            engine,
            Arc::new(FixedExpectations(true)),
            config(),
        )
    }

    fn with_expectations(expectations: Arc<dyn ExpectationTracker>) -> Self {
        Self::build(
            MemoryJobStore::new(),
            ScriptedEngine::default(),
            expectations,
            config(),
        )
    }

    fn build(
        store: MemoryJobStore,
        engine: ScriptedEngine,
        expectations: Arc<dyn ExpectationTracker>,
        config: ControllerConfig,
    ) -> Self {
        let store = Arc::new(store);
        let engine = Arc::new(engine);
        let recorder = Arc::new(MemoryRecorder::new());
        let counters = Arc::new(NamespaceCounters::new());

        let controller = Arc::new(Controller::new(
            Collaborators {
                store: store.clone(),
                engine: engine.clone(),
                expectations,
                recorder: recorder.clone(),
                metrics: counters.clone(),
            },
            config,
        ));

        Self {
            controller,
            store,
            engine,
            recorder,
            counters,
        }
    }

    fn requeues(&self, key: &str) -> u32 {
        self.controller.queue().num_requeues(&key.to_string())
    }
}

fn controller_over(
    store: Arc<ScriptedStore>,
    engine: Arc<ScriptedEngine>,
    counters: Arc<NamespaceCounters>,
) -> Arc<Controller> {
    Arc::new(Controller::new(
        Collaborators {
            store,
            engine,
            expectations: Arc::new(FixedExpectations(true)),
            recorder: Arc::new(MemoryRecorder::new()),
            metrics: counters,
        },
        config(),
    ))
}

fn config() -> ControllerConfig {
    ControllerConfig {
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_secs(1),
        },
        cache_sync_timeout: Duration::from_secs(1),
    }
}

fn job(namespace: &str, name: &str) -> Value {
    json!({
        "apiVersion": "kubeflow.org/v1",
        "kind": "TFJob",
        "metadata": { "namespace": namespace, "name": name },
        "spec": {
            "tfReplicaSpecs": {
                "PS": { "replicas": 1 },
                "Worker": { "replicas": 2 }
            }
        }
    })
}

fn key(namespace: &str, name: &str) -> JobKey {
    JobKey::new(namespace, name).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

// =============================================================================
// Single work items
// =============================================================================

#[tokio::test]
async fn test_existing_job_is_reconciled_and_forgotten() {
    let h = Harness::new(ScriptedEngine::default());
    h.store.apply(job("ns1", "job-a")).unwrap();

    h.controller.enqueue(&key("ns1", "job-a"));
    assert!(h.controller.process_next_work_item().await);

    assert_eq!(h.engine.calls(), vec!["ns1/job-a"]);
    assert_eq!(h.requeues("ns1/job-a"), 0);
    assert!(h.controller.queue().is_empty());
    assert_eq!(h.controller.queue().in_flight(), 0);
}

#[tokio::test]
async fn test_missing_job_counts_deletion_once() {
    let h = Harness::new(ScriptedEngine::default());

    h.controller.enqueue(&key("ns1", "gone"));
    assert!(h.controller.process_next_work_item().await);

    assert_eq!(h.counters.deleted("ns1"), 1);
    assert!(h.engine.calls().is_empty());
    assert_eq!(h.requeues("ns1/gone"), 0);
    assert!(h.controller.queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unsatisfied_expectations_skip_without_requeue() {
    let h = Harness::with_expectations(Arc::new(FixedExpectations(false)));
    h.store.apply(job("ns1", "job-a")).unwrap();

    h.controller.enqueue(&key("ns1", "job-a"));
    assert!(h.controller.process_next_work_item().await);

    assert!(h.engine.calls().is_empty());
    assert_eq!(h.requeues("ns1/job-a"), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.controller.queue().is_empty());
}

#[tokio::test]
async fn test_dynamic_worker_bypasses_expectations() {
    let h = Harness::with_expectations(Arc::new(FixedExpectations(false)));
    let mut obj = job("ns1", "job-a");
    obj["spec"]["enableDynamicWorker"] = json!(true);
    h.store.apply(obj).unwrap();

    h.controller.enqueue(&key("ns1", "job-a"));
    h.controller.process_next_work_item().await;

    assert_eq!(h.engine.calls(), vec!["ns1/job-a"]);
}

#[tokio::test]
async fn test_broken_expectation_tracker_counts_as_unsatisfied() {
    let trackers: Vec<Arc<dyn ExpectationTracker>> =
        vec![Arc::new(FailingExpectations), Arc::new(PanickingExpectations)];

    for tracker in trackers {
        let h = Harness::with_expectations(tracker);
        h.store.apply(job("ns1", "job-a")).unwrap();

        h.controller.enqueue(&key("ns1", "job-a"));
        assert!(h.controller.process_next_work_item().await);

        assert!(h.engine.calls().is_empty());
        assert_eq!(h.requeues("ns1/job-a"), 0);
    }
}

#[tokio::test]
async fn test_terminating_job_is_not_reconciled() {
    let h = Harness::new(ScriptedEngine::default());
    let mut obj = job("ns1", "job-a");
    obj["metadata"]["deletionTimestamp"] = json!("2026-01-01T00:00:00Z");
    h.store.apply(obj).unwrap();

    h.controller.enqueue(&key("ns1", "job-a"));
    h.controller.process_next_work_item().await;

    assert!(h.engine.calls().is_empty());
    assert_eq!(h.requeues("ns1/job-a"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_engine_failure_retries_with_growing_backoff() {
    let h = Harness::new(ScriptedEngine::failing(2));
    h.store.apply(job("ns1", "job-a")).unwrap();
    let queue = h.controller.queue();

    h.controller.enqueue(&key("ns1", "job-a"));
    h.controller.process_next_work_item().await;
    assert_eq!(h.requeues("ns1/job-a"), 1);
    assert!(queue.is_empty());

    tokio::time::sleep(Duration::from_millis(11)).await;
    assert_eq!(queue.len(), 1);
    h.controller.process_next_work_item().await;
    assert_eq!(h.requeues("ns1/job-a"), 2);

    // Second retry waits 20ms.
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert!(queue.is_empty());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.len(), 1);

    h.controller.process_next_work_item().await;
    assert_eq!(h.requeues("ns1/job-a"), 0);
    assert_eq!(h.engine.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_engine_panic_is_retried() {
    let h = Harness::new(ScriptedEngine::panicking(1));
    h.store.apply(job("ns1", "job-a")).unwrap();

    h.controller.enqueue(&key("ns1", "job-a"));
    assert!(h.controller.process_next_work_item().await);
    assert_eq!(h.requeues("ns1/job-a"), 1);
    assert_eq!(h.controller.queue().in_flight(), 0);

    tokio::time::sleep(Duration::from_millis(11)).await;
    assert!(h.controller.process_next_work_item().await);
    assert_eq!(h.requeues("ns1/job-a"), 0);
    assert_eq!(h.engine.calls().len(), 2);
}

#[tokio::test]
async fn test_undecodable_job_records_warning_and_retries() {
    let h = Harness::new(ScriptedEngine::default());
    h.store
        .apply(json!({
            "metadata": { "namespace": "ns1", "name": "job-a" },
            "spec": { "tfReplicaSpecs": { "Launcher": { "replicas": 1 } } }
        }))
        .unwrap();

    h.controller.enqueue(&key("ns1", "job-a"));
    h.controller.process_next_work_item().await;

    let events = h.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Warning);
    assert_eq!(events[0].reason, FAILED_MARSHAL_REASON);
    assert_eq!(events[0].name, "job-a");

    assert!(h.engine.calls().is_empty());
    assert_eq!(h.requeues("ns1/job-a"), 1);
}

#[tokio::test]
async fn test_malformed_key_is_dropped() {
    let h = Harness::new(ScriptedEngine::default());

    h.controller.queue().add("no-namespace".to_string());
    assert!(h.controller.process_next_work_item().await);

    assert_eq!(h.requeues("no-namespace"), 0);
    assert!(h.controller.queue().is_empty());
    assert!(h.engine.calls().is_empty());
}

#[tokio::test]
async fn test_store_failure_is_retried() {
    let h = Harness::new(ScriptedEngine::default());
    h.store.set_unavailable(true);

    h.controller.enqueue(&key("ns1", "job-a"));
    h.controller.process_next_work_item().await;

    assert_eq!(h.requeues("ns1/job-a"), 1);
    assert_eq!(h.counters.deleted("ns1"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_store_panic_releases_key_and_retries() {
    let store = Arc::new(ScriptedStore::new());
    let engine = Arc::new(ScriptedEngine::default());
    let controller = controller_over(store.clone(), engine.clone(), Arc::new(NamespaceCounters::new()));
    store.inner.apply(job("ns1", "bad")).unwrap();
    store.panic_once_on("ns1/bad");

    controller.enqueue(&key("ns1", "bad"));
    assert!(controller.process_next_work_item().await);

    assert_eq!(controller.queue().in_flight(), 0);
    assert_eq!(controller.queue().num_requeues(&"ns1/bad".to_string()), 1);

    tokio::time::sleep(Duration::from_millis(11)).await;
    assert!(controller.process_next_work_item().await);
    assert_eq!(engine.calls(), vec!["ns1/bad"]);
    assert_eq!(controller.queue().num_requeues(&"ns1/bad".to_string()), 0);
}

#[tokio::test]
async fn test_stale_cache_miss_is_confirmed_before_counting_deletion() {
    let store = Arc::new(ScriptedStore::new());
    let engine = Arc::new(ScriptedEngine::default());
    let counters = Arc::new(NamespaceCounters::new());
    let controller = controller_over(store.clone(), engine.clone(), counters.clone());
    store.inner.apply(job("ns1", "recreated")).unwrap();
    store.hide_from_cache("ns1/recreated");

    controller.enqueue(&key("ns1", "recreated"));
    controller.process_next_work_item().await;

    assert_eq!(engine.calls(), vec!["ns1/recreated"]);
    assert_eq!(counters.deleted("ns1"), 0);
}

#[tokio::test]
async fn test_duplicate_replica_types_record_warning() {
    let h = Harness::new(ScriptedEngine::default());
    h.store
        .apply(json!({
            "metadata": { "namespace": "ns1", "name": "job-a" },
            "spec": {
                "tfReplicaSpecs": {
                    "Worker": { "replicas": 1 },
                    "worker": { "replicas": 3 }
                }
            }
        }))
        .unwrap();

    h.controller.enqueue(&key("ns1", "job-a"));
    h.controller.process_next_work_item().await;

    let events = h.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, FAILED_MARSHAL_REASON);
    assert!(events[0].message.contains("duplicate replica type"));
    assert!(h.engine.calls().is_empty());
}

#[test]
fn test_notifications_for_one_job_coalesce() {
    let h = Harness::new(ScriptedEngine::default());
    let handler = h.controller.event_handler();

    handler.on_add(&job("ns1", "job-a"));
    handler.on_add(&job("ns1", "job-a"));
    handler.on_update(&job("ns1", "job-a"), &job("ns1", "job-a"));

    assert_eq!(h.controller.queue().len(), 1);
}

// =============================================================================
// Running controller
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_reconciles_all_jobs_and_stops() {
    let h = Harness::new(ScriptedEngine::default());
    for name in ["job-a", "job-b", "job-c"] {
        h.store.apply(job("ns1", name)).unwrap();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(h.controller.clone().run(2, shutdown_rx));

    wait_until(|| h.engine.calls().len() >= 3).await;

    h.store.delete("ns1", "job-b");
    wait_until(|| h.counters.deleted("ns1") == 1).await;

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("controller did not stop")
        .unwrap();
    assert!(result.is_ok());

    let mut calls = h.engine.calls();
    calls.sort();
    calls.dedup();
    assert_eq!(calls, vec!["ns1/job-a", "ns1/job-b", "ns1/job-c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_key_is_never_reconciled_concurrently() {
    let h = Harness::new(ScriptedEngine::slow(Duration::from_millis(20)));
    h.store.apply(job("ns1", "hot")).unwrap();
    h.store.apply(job("ns1", "cold")).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(h.controller.clone().run(4, shutdown_rx));

    for _ in 0..20 {
        h.store.apply(job("ns1", "hot")).unwrap();
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    wait_until(|| h.engine.calls().iter().filter(|k| *k == "ns1/hot").count() >= 2).await;

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    assert!(!h.engine.overlapped.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_finishes_in_flight_and_discards_pending() {
    let h = Harness::new(ScriptedEngine::slow(Duration::from_millis(200)));
    h.store.apply(job("ns1", "job-a")).unwrap();
    h.store.apply(job("ns1", "job-b")).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(h.controller.clone().run(1, shutdown_rx));

    wait_until(|| h.engine.in_flight() == 1).await;
    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(h.engine.calls(), vec!["ns1/job-a"]);
    assert_eq!(h.engine.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_survives_store_panic() {
    let store = Arc::new(ScriptedStore::new());
    let engine = Arc::new(ScriptedEngine::default());
    let controller = controller_over(store.clone(), engine.clone(), Arc::new(NamespaceCounters::new()));
    store.inner.apply(job("ns1", "bad")).unwrap();
    store.panic_once_on("ns1/bad");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(controller.clone().run(1, shutdown_rx));

    wait_until(|| store.panic_once.lock().unwrap().is_none()).await;
    controller.queue().add("ns1/other".to_string());
    controller.queue().add("ns1/bad".to_string());

    wait_until(|| engine.calls().contains(&"ns1/bad".to_string())).await;
    wait_until(|| controller.queue().in_flight() == 0).await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("controller did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_run_fails_when_cache_never_syncs() {
    let h = Harness::build(
        MemoryJobStore::unsynced(),
        ScriptedEngine::default(),
        Arc::new(FixedExpectations(true)),
        ControllerConfig {
            cache_sync_timeout: Duration::from_millis(200),
            ..config()
        },
    );
    h.store.apply(job("ns1", "job-a")).unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = h.controller.clone().run(2, shutdown_rx).await;

    assert!(matches!(result, Err(ControllerError::CacheSync)));
    assert!(h.engine.calls().is_empty());
}

#[tokio::test]
async fn test_run_rejects_zero_threadiness() {
    let h = Harness::new(ScriptedEngine::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = h.controller.clone().run(0, shutdown_rx).await;
    assert!(matches!(result, Err(ControllerError::InvalidThreadiness)));
}
