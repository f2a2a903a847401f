//! tf-operator
//!
//! Runs the training-job controller against an in-memory job store seeded
//! from a directory of JSON manifests. Reconciliation is logged rather than
//! applied to a cluster.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tfop_controller::config::Config;
use tfop_controller::metrics::{install_exporter, PrometheusMetrics};
use tfop_controller::recorder::TracingRecorder;
use tfop_controller::{Collaborators, Controller, LoggingEngine, MemoryJobStore};
use tfop_reconcile::ControllerExpectations;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Grace period for in-flight syncs after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TFOP_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tf-operator");
    info!(
        threadiness = config.threadiness,
        metrics_addr = ?config.metrics_addr,
        manifest_dir = ?config.manifest_dir,
        gang_scheduling = config.enable_gang_scheduling,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr {
        install_exporter(addr)?;
    }

    let store = Arc::new(MemoryJobStore::unsynced());
    if let Some(dir) = &config.manifest_dir {
        let loaded = load_manifests(&store, dir)?;
        info!(jobs = loaded, dir = %dir.display(), "Loaded job manifests");
    }
    store.set_synced(true);

    let controller = Arc::new(Controller::new(
        Collaborators {
            store,
            engine: Arc::new(LoggingEngine::new(config.enable_gang_scheduling)),
            expectations: Arc::new(ControllerExpectations::new()),
            recorder: Arc::new(TracingRecorder),
            metrics: Arc::new(PrometheusMetrics),
        },
        config.controller_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut controller_handle =
        tokio::spawn(Arc::clone(&controller).run(config.threadiness, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("controller stopped"),
                Err(e) => Err(e).context("controller task failed"),
            };
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    match tokio::time::timeout(SHUTDOWN_GRACE, controller_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Controller error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "Controller task panicked"),
        Err(_) => warn!("Timed out waiting for workers"),
    }

    info!("tf-operator shutdown complete");
    Ok(())
}

/// Apply every `*.json` manifest in `dir` to the store.
///
/// Files that fail to parse are skipped with a warning.
fn load_manifests(store: &MemoryJobStore, dir: &Path) -> Result<usize> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read manifest dir {}", dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut loaded = 0;
    for path in paths {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let obj: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(obj) => obj,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping manifest that is not JSON");
                continue;
            }
        };

        match store.apply(obj) {
            Ok(()) => loaded += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping manifest"),
        }
    }
    Ok(loaded)
}
