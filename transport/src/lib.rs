//! Framed, mutually-authenticated command/response transport between
//! the controller and its agents.
//!
//! Each connection carries a stream of named [`Command`]/[`Response`]
//! frames, length-delimited at the byte level ([`connection`]) over a
//! TLS-terminated stream ([`tls`]). Large arguments (tree [`Value`]
//! payloads, big diffs) are split into numbered fragments and rejoined
//! on receipt ([`codec`]); liveness is maintained by periodic
//! keepalive pings and an inactivity timeout, both in [`connection`].

pub mod codec;
pub mod command;
pub mod connection;
pub mod error;
pub mod tls;

pub use codec::{chunk, rejoin, CHUNK_LIMIT};
pub use command::{Command, ConnectionAgentId, DomainError, RequestId, Response};
pub use connection::{Connection, INACTIVITY_TIMEOUT, PING_INTERVAL};
pub use error::TransportError;
