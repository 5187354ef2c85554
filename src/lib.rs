//! A LAN-discoverable Kademlia distributed hash table.
//!
//! [`server::Server`] is the entry point: it owns the UDP RPC socket, the
//! routing table, local storage, and the LAN beacon, and exposes the
//! `get`/`set`/`bootstrap`/`refresh_table` operations. Everything else is
//! a building block it wires together.

pub mod config;
pub mod crawl;
pub mod discovery;
pub mod error;
pub mod id;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod rpc;
pub mod server;
pub mod storage;

pub use config::ServerConfig;
pub use error::{BeaconError, KadError, ProtocolError, RpcError};
pub use id::NodeId;
pub use node::Node;
pub use server::{PersistedState, Server};
