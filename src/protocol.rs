//! PING, STORE, FIND_NODE, FIND_VALUE, STUN semantics. Every
//! handler updates the routing table with the sender's contact — using
//! the UDP packet's observed source address, not a self-reported one —
//! before doing anything else.

use crate::error::ProtocolError;
use crate::id::NodeId;
use crate::node::Node;
use crate::routing::{AddOutcome, PendingChallenge, RoutingTable};
use crate::rpc::codec::Value;
use crate::storage::Storage;
use std::net::SocketAddr;

/// What `find_value` found: either the value itself, or the neighbors to
/// continue the search with.
#[derive(Debug, Clone)]
pub enum FindValueOutcome {
    Value(Vec<u8>),
    Neighbors(Vec<Node>),
}

/// Dispatches one inbound request. Updates `routing` with the sender's
/// contact on entry, as every handler must. Returns the wire result and,
/// if the sender's bucket was full and unsplittable, a liveness challenge
/// for the caller to carry out (see [`RoutingTable::add_contact`]).
pub struct Protocol {
    local_id: NodeId,
    ksize: usize,
}

impl Protocol {
    pub fn new(local_id: NodeId, ksize: usize) -> Self {
        Self { local_id, ksize }
    }

    fn touch_sender(
        &self,
        routing: &mut RoutingTable,
        sender_id: NodeId,
        source_addr: SocketAddr,
    ) -> Option<PendingChallenge> {
        match routing.add_contact(Node::new(sender_id, source_addr)) {
            AddOutcome::ChallengeRequired(c) => Some(c),
            AddOutcome::Accepted | AddOutcome::Dropped => None,
        }
    }

    /// Dispatches a decoded request by method name. Unknown methods
    /// return `Err(ProtocolError::UnknownMethod)`, which the caller wires
    /// to an error result on the wire.
    pub fn dispatch(
        &self,
        method: &str,
        args: &Value,
        source_addr: SocketAddr,
        routing: &mut RoutingTable,
        storage: &mut Storage,
    ) -> Result<(Value, Option<PendingChallenge>), ProtocolError> {
        let parts = args.as_tuple().unwrap_or(&[]);

        match method {
            "ping" => {
                let sender_id = parts
                    .first()
                    .and_then(|v| v.to_node_id().ok())
                    .ok_or_else(|| ProtocolError::UnknownMethod("ping: bad args".into()))?;
                let challenge = self.touch_sender(routing, sender_id, source_addr);
                Ok((Value::node_id(&self.local_id), challenge))
            }
            "store" => {
                let sender_id = parts.first().and_then(|v| v.to_node_id().ok());
                let key = parts.get(1).and_then(|v| v.to_node_id().ok());
                let value = parts.get(2).and_then(|v| v.as_bytes());
                let (Some(sender_id), Some(key), Some(value)) = (sender_id, key, value) else {
                    return Err(ProtocolError::UnknownMethod("store: bad args".into()));
                };
                let challenge = self.touch_sender(routing, sender_id, source_addr);
                storage.set(key, value.to_vec());
                Ok((Value::Bool(true), challenge))
            }
            "find_node" => {
                let sender_id = parts.first().and_then(|v| v.to_node_id().ok());
                let target = parts.get(1).and_then(|v| v.to_node_id().ok());
                let (Some(sender_id), Some(target)) = (sender_id, target) else {
                    return Err(ProtocolError::UnknownMethod("find_node: bad args".into()));
                };
                let challenge = self.touch_sender(routing, sender_id, source_addr);
                let neighbors = routing.find_neighbors(&target, self.ksize, &[sender_id]);
                Ok((encode_nodes(&neighbors), challenge))
            }
            "find_value" => {
                let sender_id = parts.first().and_then(|v| v.to_node_id().ok());
                let key = parts.get(1).and_then(|v| v.to_node_id().ok());
                let (Some(sender_id), Some(key)) = (sender_id, key) else {
                    return Err(ProtocolError::UnknownMethod("find_value: bad args".into()));
                };
                let challenge = self.touch_sender(routing, sender_id, source_addr);
                let result = match storage.get(&key) {
                    Some(value) => {
                        Value::Tuple(vec![Value::Bool(true), Value::Bytes(value.to_vec())])
                    }
                    None => {
                        let neighbors = routing.find_neighbors(&key, self.ksize, &[sender_id]);
                        Value::Tuple(vec![Value::Bool(false), encode_nodes(&neighbors)])
                    }
                };
                Ok((result, challenge))
            }
            "stun" => {
                let ip = Value::Bytes(source_addr.ip().to_string().into_bytes());
                let port = Value::Int(source_addr.port() as u64);
                Ok((Value::Tuple(vec![ip, port]), None))
            }
            other => Err(ProtocolError::UnknownMethod(other.to_string())),
        }
    }
}

fn encode_nodes(nodes: &[Node]) -> Value {
    Value::Tuple(
        nodes
            .iter()
            .map(|n| {
                Value::Tuple(vec![
                    Value::node_id(&n.id),
                    Value::Bytes(n.addr.ip().to_string().into_bytes()),
                    Value::Int(n.addr.port() as u64),
                ])
            })
            .collect(),
    )
}

pub fn decode_find_value_result(value: &Value) -> Option<FindValueOutcome> {
    let parts = value.as_tuple()?;
    let found = parts.first()?.as_bool()?;
    if found {
        let bytes = parts.get(1)?.as_bytes()?;
        Some(FindValueOutcome::Value(bytes.to_vec()))
    } else {
        let nodes = decode_nodes(parts.get(1)?)?;
        Some(FindValueOutcome::Neighbors(nodes))
    }
}

pub fn decode_nodes(value: &Value) -> Option<Vec<Node>> {
    let tuple = value.as_tuple()?;
    tuple
        .iter()
        .map(|entry| {
            let parts = entry.as_tuple()?;
            let id = parts.first()?.to_node_id().ok()?;
            let ip = std::str::from_utf8(parts.get(1)?.as_bytes()?).ok()?;
            let port = parts.get(2)?.as_int()? as u16;
            let addr: SocketAddr = format!("{ip}:{port}").parse().ok()?;
            Some(Node::new(id, addr))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_ALPHA;
    use crate::routing::DEFAULT_KSIZE;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn ping_returns_own_id_and_adds_sender() {
        let local_id = NodeId::random();
        let proto = Protocol::new(local_id, DEFAULT_KSIZE);
        let mut routing = RoutingTable::new(local_id, DEFAULT_KSIZE);
        let mut storage = Storage::new(Duration::from_secs(1), None);
        let sender_id = NodeId::random();
        let args = Value::Tuple(vec![Value::node_id(&sender_id)]);

        let (result, challenge) = proto
            .dispatch("ping", &args, addr(1), &mut routing, &mut storage)
            .unwrap();
        assert!(challenge.is_none());
        assert_eq!(result.to_node_id().unwrap(), local_id);
        assert_eq!(routing.contact_count(), 1);
    }

    #[test]
    fn store_then_find_value_returns_stored_value() {
        let local_id = NodeId::random();
        let proto = Protocol::new(local_id, DEFAULT_KSIZE);
        let mut routing = RoutingTable::new(local_id, DEFAULT_KSIZE);
        let mut storage = Storage::new(Duration::from_secs(60), None);
        let sender_id = NodeId::random();
        let key = NodeId::digest(b"hello");

        let store_args = Value::Tuple(vec![
            Value::node_id(&sender_id),
            Value::node_id(&key),
            Value::Bytes(b"world".to_vec()),
        ]);
        let (result, _) = proto
            .dispatch("store", &store_args, addr(1), &mut routing, &mut storage)
            .unwrap();
        assert_eq!(result, Value::Bool(true));

        let find_args = Value::Tuple(vec![Value::node_id(&sender_id), Value::node_id(&key)]);
        let (result, _) = proto
            .dispatch("find_value", &find_args, addr(1), &mut routing, &mut storage)
            .unwrap();
        match decode_find_value_result(&result).unwrap() {
            FindValueOutcome::Value(v) => assert_eq!(v, b"world"),
            FindValueOutcome::Neighbors(_) => panic!("expected a value"),
        }
    }

    #[test]
    fn find_node_excludes_sender_from_results() {
        let local_id = NodeId::random();
        let proto = Protocol::new(local_id, DEFAULT_ALPHA.max(DEFAULT_KSIZE));
        let mut routing = RoutingTable::new(local_id, DEFAULT_KSIZE);
        let mut storage = Storage::new(Duration::from_secs(1), None);

        let sender_id = NodeId::random();
        routing.add_contact(Node::new(sender_id, addr(5)));
        let other = NodeId::random();
        routing.add_contact(Node::new(other, addr(6)));

        let args = Value::Tuple(vec![Value::node_id(&sender_id), Value::node_id(&NodeId::random())]);
        let (result, _) = proto
            .dispatch("find_node", &args, addr(1), &mut routing, &mut storage)
            .unwrap();
        let nodes = decode_nodes(&result).unwrap();
        assert!(!nodes.iter().any(|n| n.id == sender_id));
    }

    #[test]
    fn unknown_method_is_an_error() {
        let local_id = NodeId::random();
        let proto = Protocol::new(local_id, DEFAULT_KSIZE);
        let mut routing = RoutingTable::new(local_id, DEFAULT_KSIZE);
        let mut storage = Storage::new(Duration::from_secs(1), None);
        let err = proto
            .dispatch("frobnicate", &Value::Tuple(vec![]), addr(1), &mut routing, &mut storage)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMethod(_)));
    }
}
