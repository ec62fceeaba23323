//! # orchd
//!
//! Shared identifiers for the control-plane replication engine: the
//! controller that holds authoritative desired configuration and
//! aggregated observed cluster state, and the per-node agents that stay
//! synchronized with it.
//!
//! The actual engine lives in the workspace members:
//!
//! - [`orchd_tree`] -- immutable tree values, paths, and the evolver
//!   staged-mutation facility (C1).
//! - [`orchd_diff`] -- the diff/patch algebra over tree values (C2).
//! - [`orchd_tracker`] -- the bounded generation tracker (C3).
//! - `orchd-transport` -- the framed, TLS-terminated wire protocol (C4).
//! - `orchd-store` -- the configuration store interface consumed by the
//!   controller.
//! - the `controller` and `agent` binaries, which wire the above
//!   together into C5 and C6 respectively.
mod ids;
pub mod version;

pub use crate::ids::{AgentId, Era, NodeUuid};
