//! In-process event stream between the stores and the reconciliation loop.
//!
//! The registry and spec store publish through an [`EventPublisher`]; the
//! reconciliation loop owns the receiving half. Event IDs are monotonic per
//! publisher family (all clones share one counter), and they reach the stream
//! in ID order: an ID is assigned and sent under the same lock.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use keel_events::{ClusterEvent, EventEnvelope, EventId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receiving half of the cluster event stream.
pub type EventStream = mpsc::UnboundedReceiver<EventEnvelope>;

/// Publishes cluster events with monotonic IDs.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<EventEnvelope>,
    next_id: Arc<Mutex<i64>>,
}

/// Create a connected publisher and stream.
pub fn channel() -> (EventPublisher, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let publisher = EventPublisher {
        tx,
        next_id: Arc::new(Mutex::new(1)),
    };
    (publisher, rx)
}

impl EventPublisher {
    /// Wrap the event in an envelope and send it.
    ///
    /// A closed stream is not an error: the loop has shut down and the
    /// periodic sweep on restart re-derives everything anyway.
    pub fn publish(&self, event: ClusterEvent) -> EventId {
        // A panic elsewhere cannot leave the counter inconsistent.
        let mut next_id = self
            .next_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let event_id = EventId::new(*next_id);
        *next_id += 1;

        let envelope = EventEnvelope::new(event_id, Utc::now(), event);
        debug!(
            event_id = %envelope.event_id,
            event_type = envelope.event_type(),
            aggregate_id = %envelope.aggregate_id,
            "Publishing event"
        );

        let sent = self.tx.send(envelope);
        drop(next_id);

        if sent.is_err() {
            warn!(event_id = %event_id, "Event stream closed, dropping event");
        }
        event_id
    }

    /// Re-send an already enveloped event unchanged (at-least-once redelivery).
    pub fn redeliver(&self, envelope: EventEnvelope) {
        if self.tx.send(envelope).is_err() {
            warn!("Event stream closed, dropping redelivery");
        }
    }
}
