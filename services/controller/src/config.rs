//! Configuration for the reconciler.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use keel_reconcile::{
    BackoffPolicy, DEFAULT_ATTACH_TIMEOUT, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX,
    DEFAULT_GRACE_PERIOD, DEFAULT_SWEEP_INTERVAL,
};

use crate::failover::FailoverConfig;

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster manifest with nodes and workload specs.
    pub cluster_file: PathBuf,

    /// Log filter used when RUST_LOG is unset.
    pub log_level: String,

    /// How long a node may be NotReady before it counts as lost.
    pub grace_period: Duration,

    /// Interval between full sweeps.
    pub sweep_interval: Duration,

    /// Bound on a single volume release or attach.
    pub attach_timeout: Duration,

    pub backoff: BackoffPolicy,

    /// Read JSON-lines liveness reports from stdin.
    pub liveness_from_stdin: bool,

    /// Mark every manifest node Ready at startup instead of waiting for the feed.
    pub assume_ready: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cluster_file = std::env::var("KEEL_CLUSTER_FILE")
            .unwrap_or_else(|_| "/etc/keel/cluster.toml".to_string())
            .into();

        let log_level = std::env::var("KEEL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let grace_period = secs_var("KEEL_GRACE_PERIOD_SECS", DEFAULT_GRACE_PERIOD)?;
        let sweep_interval = secs_var("KEEL_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL)?;
        let attach_timeout = secs_var("KEEL_ATTACH_TIMEOUT_SECS", DEFAULT_ATTACH_TIMEOUT)?;
        let backoff = BackoffPolicy {
            base: secs_var("KEEL_BACKOFF_BASE_SECS", DEFAULT_BACKOFF_BASE)?,
            max: secs_var("KEEL_BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX)?,
        };

        if sweep_interval.is_zero() {
            anyhow::bail!("KEEL_SWEEP_INTERVAL_SECS must be greater than zero");
        }
        if backoff.base > backoff.max {
            anyhow::bail!("KEEL_BACKOFF_BASE_SECS must not exceed KEEL_BACKOFF_MAX_SECS");
        }

        let liveness_from_stdin = bool_var("KEEL_LIVENESS_STDIN")?.unwrap_or(true);
        let assume_ready = bool_var("KEEL_ASSUME_READY")?.unwrap_or(false);

        Ok(Self {
            cluster_file,
            log_level,
            grace_period,
            sweep_interval,
            attach_timeout,
            backoff,
            liveness_from_stdin,
            assume_ready,
        })
    }

    pub fn failover(&self) -> FailoverConfig {
        FailoverConfig {
            attach_timeout: self.attach_timeout,
            backoff: self.backoff.clone(),
        }
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .with_context(|| format!("{name} must be a whole number of seconds, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn bool_var(name: &str) -> Result<Option<bool>> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            _ => anyhow::bail!("{name} must be true or false, got '{raw}'"),
        },
        Err(_) => Ok(None),
    }
}
