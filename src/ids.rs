use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

/// Opaque identifier assigned to an agent connection.
///
/// Stable across reconnects of the same node (it is derived from the
/// node's long-lived key material, not the TCP connection), so the
/// controller can reattach a reconnecting agent to its remembered
/// acknowledgement state.
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
#[archive(as = "AgentId")]
#[repr(transparent)]
pub struct AgentId([u8; 16]);

impl AgentId {
    pub fn new(id: [u8; 16]) -> Self {
        Self(id)
    }
}

impl AsRef<[u8; 16]> for AgentId {
    fn as_ref(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<AgentId> for [u8; 16] {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

impl std::fmt::Debug for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for AgentId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("agent id must be 16 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Identifier for a worker node, stable across reboots.
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
#[archive(as = "NodeUuid")]
#[repr(transparent)]
pub struct NodeUuid([u8; 16]);

impl NodeUuid {
    pub fn new(id: [u8; 16]) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for NodeUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for NodeUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Opaque identifier for a node's current incarnation.
///
/// Bumped by the node across reboots; used to invalidate state
/// fragments recorded under a prior era (see
/// [`on_set_node_era`](crate) in the controller).
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
#[archive(as = "Era")]
#[repr(transparent)]
pub struct Era([u8; 16]);

impl Era {
    pub fn new(id: [u8; 16]) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for Era {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for Era {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
