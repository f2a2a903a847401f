//! Controller configuration.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use tfop_reconcile::BackoffPolicy;

use crate::controller::ControllerConfig;

/// Controller configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of concurrent workers.
    pub threadiness: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Address for the Prometheus exporter; disabled when unset.
    pub metrics_addr: Option<SocketAddr>,

    /// First retry delay for a failing key.
    pub backoff_base: Duration,

    /// Maximum retry delay.
    pub backoff_max: Duration,

    /// How long to wait for the job cache at startup.
    pub cache_sync_timeout: Duration,

    /// Directory of job manifests (`*.json`) to seed the in-memory store.
    pub manifest_dir: Option<PathBuf>,

    /// Whether the engine should plan gang-scheduled pod groups.
    pub enable_gang_scheduling: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let threadiness: usize = var("TFOP_THREADINESS")
            .map(|v| v.parse())
            .transpose()
            .context("TFOP_THREADINESS must be a positive integer.")?
            .unwrap_or(1);
        if threadiness == 0 {
            anyhow::bail!("TFOP_THREADINESS must be a positive integer.");
        }

        let log_level = var("TFOP_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let metrics_addr: Option<SocketAddr> = var("TFOP_METRICS_ADDR")
            .filter(|v| !v.is_empty())
            .map(|v| v.parse())
            .transpose()
            .context("TFOP_METRICS_ADDR must be host:port.")?;

        let backoff_base_ms: u64 = var("TFOP_BACKOFF_BASE_MS")
            .map(|v| v.parse())
            .transpose()
            .context("TFOP_BACKOFF_BASE_MS must be an integer (milliseconds).")?
            .unwrap_or(5);

        let backoff_max_secs: u64 = var("TFOP_BACKOFF_MAX_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("TFOP_BACKOFF_MAX_SECS must be an integer (seconds).")?
            .unwrap_or(1000);

        let cache_sync_timeout_secs: u64 = var("TFOP_CACHE_SYNC_TIMEOUT_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("TFOP_CACHE_SYNC_TIMEOUT_SECS must be an integer (seconds).")?
            .unwrap_or(60);

        let manifest_dir = var("TFOP_MANIFEST_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let enable_gang_scheduling = var("TFOP_ENABLE_GANG_SCHEDULING")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let backoff_base = Duration::from_millis(backoff_base_ms.max(1));
        Ok(Self {
            threadiness,
            log_level,
            metrics_addr,
            backoff_base,
            backoff_max: Duration::from_secs(backoff_max_secs).max(backoff_base),
            cache_sync_timeout: Duration::from_secs(cache_sync_timeout_secs),
            manifest_dir,
            enable_gang_scheduling,
        })
    }

    /// Loop tunables derived from this configuration.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            backoff: BackoffPolicy {
                base: self.backoff_base,
                max: self.backoff_max,
            },
            cache_sync_timeout: self.cache_sync_timeout,
        }
    }
}
