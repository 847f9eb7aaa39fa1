//! Liveness feed.
//!
//! Reads JSON-lines liveness reports (`{"node": "k3s-worker", "status": "NotReady"}`)
//! from any async reader, typically stdin piped from a kubelet watcher, and
//! forwards them to the node registry. Bad lines are logged and skipped.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use keel_events::LivenessReport;

use crate::registry::{NodeRegistry, RegistryError};

/// Counts from one feed run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeedStats {
    pub lines: u64,
    pub transitions: u64,
    pub rejected: u64,
}

/// Consume reports until EOF or shutdown.
pub async fn run_liveness_feed<R>(
    reader: R,
    registry: &NodeRegistry,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = FeedStats::default();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(line) = line else {
            info!(lines = stats.lines, "Liveness feed reached end of input");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        stats.lines += 1;

        let (node, liveness) = match LivenessReport::from_json_line(&line) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, line = %line, "Ignoring malformed liveness report");
                stats.rejected += 1;
                continue;
            }
        };

        match registry.update_liveness(&node, liveness).await {
            Ok(true) => stats.transitions += 1,
            Ok(false) => debug!(node = %node, liveness = %liveness, "Liveness unchanged"),
            Err(e @ RegistryError::NodeNotFound(_)) => {
                warn!(error = %e, "Liveness report for unknown node");
                stats.rejected += 1;
            }
            Err(e) => {
                warn!(error = %e, "Liveness update failed");
                stats.rejected += 1;
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events;
    use crate::model::Node;

    #[tokio::test]
    async fn test_feed_applies_transitions_and_skips_garbage() {
        let (publisher, _stream) = events::channel();
        let registry = NodeRegistry::new(publisher, Duration::from_secs(300));
        registry
            .register(Node::new("k3s-worker".parse().unwrap(), "fsn1"))
            .await
            .unwrap();

        let input = concat!(
            "{\"node\":\"k3s-worker\",\"status\":\"True\"}\n",
            "{\"node\":\"k3s-worker\",\"status\":\"True\"}\n",
            "\n",
            "not json\n",
            "{\"node\":\"ghost\",\"status\":\"True\"}\n",
            "{\"node\":\"k3s-worker\",\"status\":\"False\"}\n",
        );
        let (_tx, rx) = watch::channel(false);

        let stats = run_liveness_feed(input.as_bytes(), &registry, rx)
            .await
            .unwrap();
        assert_eq!(
            stats,
            FeedStats {
                lines: 5,
                transitions: 2,
                rejected: 2,
            }
        );
        assert!(!registry
            .snapshot()
            .await
            .is_ready(&"k3s-worker".parse().unwrap()));
    }
}
