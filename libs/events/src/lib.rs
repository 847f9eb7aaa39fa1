//! # keel-events
//!
//! Event definitions for the keel placement reconciler.
//!
//! ## Design Principles
//!
//! - Events are immutable records of observed state transitions
//! - Liveness events are edge-triggered: repeated heartbeats with the same
//!   status never produce an event
//! - Every event belongs to exactly one aggregate (a node or a workload)
//! - Delivery is ordered and at-least-once, so consumers deduplicate on
//!   the monotonic `event_id`
//!
//! ## Event Types
//!
//! - Node events (`node.*`): registration, liveness transitions, loss after
//!   the grace period, decommission
//! - Workload events (`workload.*`): spec accepted, spec deleted

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
