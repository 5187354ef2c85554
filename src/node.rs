//! Node descriptors: an id paired with a known network endpoint.

use crate::id::{Distance, NodeId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A peer the local node knows an endpoint for.
///
/// Equality and hashing are on `id` alone: two `Node`s with the same id
/// but different recorded addresses are the same contact, the later one
/// simply refreshing the former (this is what `RoutingTable::add_contact`
/// relies on).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    pub fn distance_to(&self, id: &NodeId) -> Distance {
        self.id.distance(id)
    }

    /// The `(id, ip, port)` view used by the wire codec and persisted state.
    pub fn as_tuple(&self) -> (NodeId, String, u16) {
        (self.id, self.addr.ip().to_string(), self.addr.port())
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_address() {
        let id = NodeId::digest(b"n");
        let a = Node::new(id, "127.0.0.1:1".parse().unwrap());
        let b = Node::new(id, "127.0.0.1:2".parse().unwrap());
        assert_eq!(a, b);
    }
}
