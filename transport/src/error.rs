/// Transport-layer errors, grouped the way the error handling policy
/// groups them: transient conditions that simply drop the connection,
/// and protocol violations that also close it but are worth logging
/// distinctly from an ordinary reset.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying stream reset, the inactivity timer fired, or the
    /// TLS handshake failed. Policy: drop the connection and release
    /// all inflight state; the peer is expected to reconnect. Never
    /// retried inline.
    #[error("transient transport failure: {0}")]
    Transient(#[source] std::io::Error),

    /// No message (ping or otherwise) was received from the peer
    /// within `2 * PING_INTERVAL`.
    #[error("inactivity timeout: no message in {0:?}")]
    InactivityTimeout(std::time::Duration),

    /// An unknown command name, a malformed argument, or a type
    /// mismatch after decoding. Policy: close the connection; the
    /// configuration store is never reached.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A chunked argument's fragments didn't reassemble (missing or
    /// out-of-order fragment index). A kind of protocol violation,
    /// named separately because it's diagnosable from the frame layer
    /// alone, before any typed decoding is attempted.
    #[error("malformed chunked argument {name:?}: {reason}")]
    ChunkReassembly { name: String, reason: &'static str },

    /// The peer's VERSION reply carries a different major version.
    #[error("protocol major version mismatch: local {local}, peer {peer}")]
    VersionMismatch { local: u32, peer: u32 },
}

impl TransportError {
    /// True for errors whose policy is "drop and let the peer
    /// reconnect" rather than "close and log as a violation".
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_) | TransportError::InactivityTimeout(_))
    }
}
