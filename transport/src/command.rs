use orchd::{AgentId, Era, NodeUuid};
use orchd_diff::Patch;
use orchd_tree::{Hash, Value};

/// A command-stream request identifier, correlating a `Command` with
/// its eventual `Response` on the same connection. Commands on one
/// connection are otherwise unordered -- only the id ties a response
/// back to its request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RequestId(pub u64);

/// One command-stream message. See the wire command table in the
/// transport module docs.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Exchanged once per connection; a major-version mismatch is a
    /// protocol violation, not a negotiable fallback.
    Version,
    /// One-way liveness ping; no response is expected.
    Noop,
    /// Agent to controller: a batch of observed-state fragments folded
    /// into the controller's aggregate state.
    NodeState {
        /// Opaque per-fragment observed values.
        fragments: Vec<Value>,
        /// Correlates this report with the agent-side convergence run
        /// that produced it, for tracing across the wire.
        eliot_context: String,
    },
    /// Agent to controller, sent before a controlled reboot so the
    /// controller can discard this node's stale fragments afterward.
    SetNodeEra { era: Era, node_uuid: NodeUuid },
    /// Agent to controller: claim exclusive ownership of a block
    /// device for a dataset.
    SetBlockdeviceId {
        dataset_id: String,
        blockdevice_id: String,
    },
    /// Controller to agent: adopt a full configuration/state snapshot.
    UpdateFull {
        configuration: Value,
        configuration_generation: Hash,
        state: Value,
        state_generation: Hash,
        eliot_context: String,
    },
    /// Controller to agent: adopt a configuration/state diff, provided
    /// the agent's current hashes match `start_*_generation`.
    UpdateDiff {
        configuration_diff: Patch,
        start_configuration_generation: Hash,
        end_configuration_generation: Hash,
        state_diff: Patch,
        start_state_generation: Hash,
        end_state_generation: Hash,
        eliot_context: String,
    },
}

impl Command {
    /// The wire name, used for logging and in the chunked-argument
    /// naming scheme (`name.0`, `name.1`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => "VERSION",
            Command::Noop => "NOOP",
            Command::NodeState { .. } => "NODE_STATE",
            Command::SetNodeEra { .. } => "SET_NODE_ERA",
            Command::SetBlockdeviceId { .. } => "SET_BLOCKDEVICE_ID",
            Command::UpdateFull { .. } => "UPDATE_FULL",
            Command::UpdateDiff { .. } => "UPDATE_DIFF",
        }
    }
}

/// A structured domain error code carried in a [`Response::Error`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DomainError {
    /// `SET_BLOCKDEVICE_ID` named a dataset already bound to a
    /// different block device.
    #[error("dataset already owned by a different blockdevice")]
    AlreadyOwned,
}

/// The reply to a [`Command`] that expects one (everything but
/// [`Command::Noop`]).
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// Reply to `VERSION`.
    Version { major: u32 },
    /// Reply with no payload (`SET_NODE_ERA`, successful
    /// `SET_BLOCKDEVICE_ID`, `NODE_STATE`).
    Empty,
    /// Reply to `UPDATE_FULL`/`UPDATE_DIFF`: the hashes the responder
    /// holds after attempting to apply the update -- not necessarily
    /// the ones the update targeted, if verification failed.
    Ack {
        current_configuration_generation: Hash,
        current_state_generation: Hash,
    },
    /// A structured domain-level failure (see [`DomainError`]).
    Error(DomainError),
}

/// Identifies which agent a connection belongs to, for the
/// per-connection bookkeeping kept by the controller broadcast
/// service. Stable across reconnects.
pub type ConnectionAgentId = AgentId;
