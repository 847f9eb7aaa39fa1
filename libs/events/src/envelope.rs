//! Event envelope - the common wrapper for all events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ClusterEvent;

/// Aggregate type for event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Node,
    Workload,
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateType::Node => "node",
            AggregateType::Workload => "workload",
        };
        write!(f, "{}", s)
    }
}

/// Event ID is a simple monotonic integer assigned by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(i64);

impl EventId {
    /// Creates a new EventId from an i64.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the underlying i64 value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic event identifier, unique per publisher.
    pub event_id: EventId,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The type of aggregate this event belongs to.
    pub aggregate_type: AggregateType,

    /// The name of the aggregate instance.
    pub aggregate_id: String,

    /// The event itself (type tag plus payload).
    pub event: ClusterEvent,
}

impl EventEnvelope {
    /// Wrap an event with its envelope metadata.
    pub fn new(event_id: EventId, occurred_at: DateTime<Utc>, event: ClusterEvent) -> Self {
        let (aggregate_type, aggregate_id) = event.aggregate();
        let aggregate_id = aggregate_id.to_string();
        Self {
            event_id,
            occurred_at,
            aggregate_type,
            aggregate_id,
            event,
        }
    }

    /// The event type name.
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}
