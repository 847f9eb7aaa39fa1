//! # keel-id
//!
//! Typed names and IDs for the keel placement reconciler.
//!
//! ## Design Principles
//!
//! - Cluster resources (nodes, workloads, volumes) are identified by the
//!   names the orchestrator already uses, so they are validated strings
//!   rather than generated IDs
//! - Capability labels are case-insensitive and stored lowercase
//! - Intents sent to the orchestrator carry a generated, sortable ID that
//!   doubles as an idempotency key
//!
//! ## Formats
//!
//! Names follow the Kubernetes DNS-1123 subdomain rules:
//! - `k3s-worker-1`
//! - `cardano-relay`
//!
//! Intent IDs use the prefixed ULID format `{prefix}_{ulid}`:
//! - `int_01HV4Z2WQXKJNM8GPQY6VBKC3D`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
