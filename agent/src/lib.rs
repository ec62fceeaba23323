//! Applies the controller's configuration/state updates to this
//! node's local copies, verifying hashes before ever calling the
//! local convergence callback. See [`AgentReceiver`].

mod receiver;

pub use receiver::{AgentReceiver, ConvergenceCallback, Generations};
