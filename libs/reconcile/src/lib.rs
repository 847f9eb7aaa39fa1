//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired placement to the observed cluster. Key concepts:
//!
//! - **Desired state**: Workload specs and the placement derived from them.
//! - **Observed state**: Node liveness and volume attachments.
//! - **Convergence**: Issuing orchestrator intents until both agree.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - Event processing is monotonic (checkpoints never move backwards)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A spec hash for deterministic comparison.
///
/// Used to detect when a workload spec has actually changed, so that a
/// re-submitted identical spec does not trigger re-evaluation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecHash(String);

impl SpecHash {
    /// Hash a JSON value.
    ///
    /// `serde_json::Map` keeps keys sorted, so the compact encoding is
    /// canonical and key order in the input never changes the hash.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let digest = Sha256::digest(json.to_string().as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    /// Compute a spec hash from any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(|json| Self::from_json(&json))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checkpoint for event consumption.
///
/// Tracks the last processed event so at-least-once delivery does not
/// apply the same event twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Last applied event ID.
    pub last_event_id: i64,

    /// Timestamp of last checkpoint update.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    /// Create a new checkpoint.
    pub fn new(last_event_id: i64) -> Self {
        Self {
            last_event_id,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Check if an event has already been processed.
    pub fn is_processed(&self, event_id: i64) -> bool {
        event_id <= self.last_event_id
    }

    /// Advance the checkpoint to a new event.
    pub fn advance(&mut self, event_id: i64) {
        if event_id > self.last_event_id {
            self.last_event_id = event_id;
            self.updated_at = chrono::Utc::now();
        }
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Exponential backoff configuration.
///
/// Attempts are unbounded; the delay doubles from `base` until it reaches
/// `max` and stays there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Default full-sweep interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default grace period before a NotReady node counts as lost.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5 * 60); // 5 minutes

/// Default bound on a single volume release or attach.
pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(2 * 60); // 2 minutes

/// Default first backoff delay after a failed attach.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(10);

/// Default backoff ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60); // 5 minutes
