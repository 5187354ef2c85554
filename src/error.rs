//! Layered error types. RPC/protocol/beacon failures never propagate as
//! exceptions out of the event loop; they resolve a pending future or are
//! logged and dropped. Only [`KadError`] is surfaced to a [`crate::server::Server`]
//! caller.

use thiserror::Error;

/// Failures internal to the RPC transport (§4.4, §7).
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    #[error("no response within the rpc timeout")]
    Timeout,
    #[error("outbound payload of {size} bytes exceeds the UDP MTU of {mtu}")]
    MessageTooLarge { size: usize, mtu: usize },
    #[error("inbound datagram could not be parsed: {0}")]
    Malformed(String),
    #[error("the rpc transport is shutting down")]
    ShuttingDown,
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Io(e.to_string())
    }
}

/// Failures handling an inbound request; returned as an error result on
/// the wire, never surfaced to the caller of [`crate::server::Server`].
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),
}

/// A malformed or out-of-protocol beacon frame (§4.7, §7): logged and
/// dropped at the discovery layer, never surfaced.
#[derive(Debug, Error, Clone)]
pub enum BeaconError {
    #[error("invalid beacon frame: {reason}")]
    Invalid { reason: String },
}

/// The only two error kinds a [`crate::server::Server`] caller ever sees (§7).
#[derive(Debug, Error, Clone)]
pub enum KadError {
    #[error("no known neighbors to perform the lookup")]
    NoNeighbors,
    #[error("value not found on the network")]
    NotFound,
}
