//! Controller-side coordination: folding agent-reported state,
//! watching the configuration store, and keeping every connected
//! agent converged on the latest configuration and state.

mod service;

pub use service::{BroadcastService, BATCHING_DELAY};
