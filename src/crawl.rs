//! Iterative α-parallel lookups: `NodeSpiderCrawl` and `ValueSpiderCrawl`.
//! A round issues up to `alpha` concurrent `find_node`/`find_value` calls,
//! waits for all of them, then folds the results into a sorted, capped
//! candidate list before deciding whether to continue.

use crate::id::{Distance, NodeId};
use crate::node::Node;
use crate::protocol::{decode_find_value_result, decode_nodes, FindValueOutcome};
use crate::routing::{AddOutcome, ChallengeResult, RoutingTable};
use crate::rpc::codec::Value;
use crate::rpc::RpcTransport;
use futures::future::join_all;
use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Outcome of a value lookup: either the value itself, or nothing —
/// the caller (the server) surfaces the latter as `NotFound`.
#[derive(Debug, Clone)]
pub enum ValueLookupOutcome {
    Value(Vec<u8>),
    NotFound,
}

struct CandidateList {
    target: NodeId,
    ksize: usize,
    candidates: Vec<Node>,
    contacted: HashSet<NodeId>,
    reached: HashSet<NodeId>,
}

impl CandidateList {
    fn new(target: NodeId, ksize: usize, initial: Vec<Node>) -> Self {
        let mut list = Self {
            target,
            ksize,
            candidates: Vec::new(),
            contacted: HashSet::new(),
            reached: HashSet::new(),
        };
        for n in initial {
            list.insert(n);
        }
        list
    }

    fn insert(&mut self, n: Node) {
        if self.candidates.iter().any(|c| c.id == n.id) {
            return;
        }
        self.candidates.push(n);
        self.candidates.sort_by_key(|c| (c.distance_to(&self.target), c.id));
        self.candidates.truncate(self.ksize);
    }

    fn best_distance(&self) -> Option<Distance> {
        self.candidates.first().map(|c| c.distance_to(&self.target))
    }

    fn next_batch(&self, alpha: usize) -> Vec<Node> {
        self.candidates
            .iter()
            .filter(|c| !self.contacted.contains(&c.id))
            .take(alpha)
            .copied()
            .collect()
    }

    fn has_uncontacted(&self) -> bool {
        self.candidates.iter().any(|c| !self.contacted.contains(&c.id))
    }

    fn remove(&mut self, id: &NodeId) {
        self.candidates.retain(|c| c.id != *id);
    }
}

enum RoundReply {
    Node { from: Node, neighbors: Vec<Node> },
    Value { from: Node, value: Vec<u8> },
    Failed { id: NodeId },
}

async fn run_round_node(
    rpc: &RpcTransport,
    local_id: NodeId,
    target: NodeId,
    batch: &[Node],
) -> Vec<RoundReply> {
    let calls = batch.iter().map(|node| {
        let node = *node;
        async move {
            let args = Value::Tuple(vec![Value::node_id(&local_id), Value::node_id(&target)]);
            match rpc.call(node.addr, "find_node", args).await {
                Ok(result) => match decode_nodes(&result) {
                    Some(neighbors) => RoundReply::Node {
                        from: node,
                        neighbors,
                    },
                    None => RoundReply::Failed { id: node.id },
                },
                Err(_) => RoundReply::Failed { id: node.id },
            }
        }
    });
    join_all(calls).await
}

async fn run_round_value(
    rpc: &RpcTransport,
    local_id: NodeId,
    target: NodeId,
    batch: &[Node],
) -> Vec<RoundReply> {
    let calls = batch.iter().map(|node| {
        let node = *node;
        async move {
            let args = Value::Tuple(vec![Value::node_id(&local_id), Value::node_id(&target)]);
            match rpc.call(node.addr, "find_value", args).await {
                Ok(result) => match decode_find_value_result(&result) {
                    Some(FindValueOutcome::Value(v)) => RoundReply::Value { from: node, value: v },
                    Some(FindValueOutcome::Neighbors(neighbors)) => RoundReply::Node {
                        from: node,
                        neighbors,
                    },
                    None => RoundReply::Failed { id: node.id },
                },
                Err(_) => RoundReply::Failed { id: node.id },
            }
        }
    });
    join_all(calls).await
}

/// Refreshes the routing table with a responder (the crawl's outbound
/// analogue of a handler touching the table on an inbound request).
///
/// Only ever holds `routing`'s write lock for the duration of a single,
/// non-suspending table mutation — never across an RPC await. A crawl can
/// run for many round-trips; pinning the table's write guard for that
/// whole span would block every inbound `ping`/`find_node`/`find_value`
/// this node needs to answer for as long as the crawl is in flight (the
/// spec's single-event-loop model never blocks handlers on a lookup in
/// progress). So a liveness challenge here is resolved by taking the lock
/// just long enough to register the candidate, releasing it across the
/// PING, then re-taking it just long enough to apply the outcome.
async fn confirm_reachable(rpc: &RpcTransport, routing: &RwLock<RoutingTable>, node: Node) {
    let outcome = routing.write().await.add_contact(node);
    if let AddOutcome::ChallengeRequired(challenge) = outcome {
        let args = Value::Tuple(vec![Value::node_id(&challenge.head.id)]);
        let alive = rpc.call(challenge.head.addr, "ping", args).await.is_ok();
        let result = if alive {
            ChallengeResult::HeadAlive
        } else {
            ChallengeResult::HeadDead
        };
        routing.write().await.resolve_challenge(challenge, result);
    }
}

/// Runs a `NodeSpiderCrawl`: returns up to `ksize` reached contacts,
/// sorted by distance to `target`. Takes `routing` as a shared lock,
/// not an exclusive borrow: the crawl's many round-trip awaits never hold
/// the table's write lock open, so inbound requests keep being served
/// while a lookup is in flight.
pub async fn crawl_nodes(
    rpc: &RpcTransport,
    routing: &RwLock<RoutingTable>,
    local_id: NodeId,
    target: NodeId,
    initial: Vec<Node>,
    ksize: usize,
    alpha: usize,
) -> Vec<Node> {
    let mut list = CandidateList::new(target, ksize, initial);

    loop {
        let batch = list.next_batch(alpha);
        if batch.is_empty() {
            break;
        }
        let before = list.best_distance();

        let replies = run_round_node(rpc, local_id, target, &batch).await;
        for reply in replies {
            match reply {
                RoundReply::Node { from, neighbors } => {
                    list.contacted.insert(from.id);
                    list.reached.insert(from.id);
                    confirm_reachable(rpc, routing, from).await;
                    for n in neighbors {
                        list.insert(n);
                    }
                }
                RoundReply::Value { .. } => unreachable!("node crawl never issues find_value"),
                RoundReply::Failed { id } => {
                    list.contacted.insert(id);
                    list.remove(&id);
                }
            }
        }

        let after = list.best_distance();
        let made_progress = matches!((before, after), (Some(b), Some(a)) if a < b);
        trace!(?before, ?after, "crawl round complete");

        if !made_progress && (!list.has_uncontacted() || list.reached.len() >= ksize) {
            break;
        }
    }

    let mut reached: Vec<Node> = list
        .candidates
        .iter()
        .filter(|c| list.reached.contains(&c.id))
        .copied()
        .collect();
    reached.sort_by_key(|c| (c.distance_to(&target), c.id));
    reached.truncate(ksize);
    reached
}

/// Runs a `ValueSpiderCrawl`: returns the value if found (caching it on
/// the closest reached node that didn't already hold it), else
/// `NotFound`. Takes `routing` as a shared lock for the same reason as
/// [`crawl_nodes`]: inbound requests must keep being served while this
/// lookup is in flight.
pub async fn crawl_value(
    rpc: &RpcTransport,
    routing: &RwLock<RoutingTable>,
    local_id: NodeId,
    target: NodeId,
    initial: Vec<Node>,
    ksize: usize,
    alpha: usize,
) -> ValueLookupOutcome {
    let mut list = CandidateList::new(target, ksize, initial);
    let mut found: Vec<(Node, Vec<u8>)> = Vec::new();

    loop {
        let batch = list.next_batch(alpha);
        if batch.is_empty() {
            break;
        }
        let before = list.best_distance();

        let replies = run_round_value(rpc, local_id, target, &batch).await;
        let mut round_found = false;
        for reply in replies {
            match reply {
                RoundReply::Value { from, value } => {
                    list.contacted.insert(from.id);
                    list.reached.insert(from.id);
                    confirm_reachable(rpc, routing, from).await;
                    found.push((from, value));
                    round_found = true;
                }
                RoundReply::Node { from, neighbors } => {
                    list.contacted.insert(from.id);
                    list.reached.insert(from.id);
                    confirm_reachable(rpc, routing, from).await;
                    for n in neighbors {
                        list.insert(n);
                    }
                }
                RoundReply::Failed { id } => {
                    list.contacted.insert(id);
                    list.remove(&id);
                }
            }
        }

        if round_found {
            break;
        }

        let after = list.best_distance();
        let made_progress = matches!((before, after), (Some(b), Some(a)) if a < b);
        if !made_progress && (!list.has_uncontacted() || list.reached.len() >= ksize) {
            break;
        }
    }

    if found.is_empty() {
        return ValueLookupOutcome::NotFound;
    }

    // Conflicting values: the one from the closest responder wins.
    found.sort_by_key(|(node, _)| (node.distance_to(&target), node.id));
    let (winner, value) = found[0].clone();
    debug!(winner = %winner.id, "value found, caching on closest non-holder");

    // Cache on the closest reached node that did NOT return the value.
    let holders: HashSet<NodeId> = found.iter().map(|(n, _)| n.id).collect();
    let cache_target = list
        .candidates
        .iter()
        .filter(|c| list.reached.contains(&c.id) && !holders.contains(&c.id))
        .min_by_key(|c| (c.distance_to(&target), c.id))
        .copied();

    if let Some(node) = cache_target {
        let args = Value::Tuple(vec![
            Value::node_id(&local_id),
            Value::node_id(&target),
            Value::Bytes(value.clone()),
        ]);
        let _ = rpc.call(node.addr, "store", args).await;
    }

    ValueLookupOutcome::Value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_ALPHA, DEFAULT_RPC_TIMEOUT};
    use crate::routing::DEFAULT_KSIZE;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Spawns a node running the real protocol dispatcher over a real
    /// loopback UDP socket, pre-seeded with `seed` in its routing table
    /// and `stored` in its storage. Returns its address.
    async fn spawn_node(
        local_id: NodeId,
        seed: Vec<Node>,
        stored: Vec<(NodeId, Vec<u8>)>,
    ) -> SocketAddr {
        let (rpc, mut requests) =
            RpcTransport::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_RPC_TIMEOUT)
                .await
                .unwrap();
        let addr = rpc.local_addr().unwrap();
        let rpc = std::sync::Arc::new(rpc);

        tokio::spawn(async move {
            let mut routing = RoutingTable::new(local_id, DEFAULT_KSIZE);
            for n in seed {
                routing.add_contact(n);
            }
            let mut storage = Storage::new(Duration::from_secs(600), None);
            for (k, v) in stored {
                storage.set(k, v);
            }
            let proto = crate::protocol::Protocol::new(local_id, DEFAULT_KSIZE);
            let (_tx, _rx) = mpsc::channel::<()>(1);
            while let Some(req) = requests.recv().await {
                if let Ok((result, _challenge)) = proto.dispatch(
                    &req.method,
                    &req.args,
                    req.from,
                    &mut routing,
                    &mut storage,
                ) {
                    let _ = rpc.respond(req.from, req.rpc_id, result).await;
                }
            }
        });

        addr
    }

    use crate::storage::Storage;

    #[tokio::test]
    async fn node_crawl_converges_on_a_chain() {
        // A -> B -> C: A only knows B, B knows C.
        let a_id = NodeId::random();
        let b_id = NodeId::random();
        let c_id = NodeId::random();

        let c_addr = spawn_node(c_id, vec![], vec![]).await;
        let b_addr = spawn_node(b_id, vec![Node::new(c_id, c_addr)], vec![]).await;

        let (rpc, _rx) = RpcTransport::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_RPC_TIMEOUT)
            .await
            .unwrap();
        let routing = RwLock::new(RoutingTable::new(a_id, DEFAULT_KSIZE));

        let target = NodeId::random();
        let result = crawl_nodes(
            &rpc,
            &routing,
            a_id,
            target,
            vec![Node::new(b_id, b_addr)],
            DEFAULT_KSIZE,
            DEFAULT_ALPHA,
        )
        .await;

        let ids: HashSet<NodeId> = result.iter().map(|n| n.id).collect();
        assert!(ids.contains(&b_id));
        assert!(ids.contains(&c_id));
    }

    #[tokio::test]
    async fn value_crawl_finds_and_caches_on_non_holder() {
        let a_id = NodeId::random();
        let b_id = NodeId::random();
        let c_id = NodeId::random();
        let key = NodeId::digest(b"k");

        let c_addr = spawn_node(c_id, vec![], vec![(key, b"v".to_vec())]).await;
        let b_addr = spawn_node(b_id, vec![Node::new(c_id, c_addr)], vec![]).await;

        let (rpc, _rx) = RpcTransport::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_RPC_TIMEOUT)
            .await
            .unwrap();
        let routing = RwLock::new(RoutingTable::new(a_id, DEFAULT_KSIZE));

        let outcome = crawl_value(
            &rpc,
            &routing,
            a_id,
            key,
            vec![Node::new(b_id, b_addr)],
            DEFAULT_KSIZE,
            DEFAULT_ALPHA,
        )
        .await;

        match outcome {
            ValueLookupOutcome::Value(v) => assert_eq!(v, b"v"),
            ValueLookupOutcome::NotFound => panic!("expected a value"),
        }

        // give the fire-and-forget cache store a moment to land
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cache_args = Value::Tuple(vec![Value::node_id(&a_id), Value::node_id(&key)]);
        let cached = rpc.call(b_addr, "find_value", cache_args).await.unwrap();
        match decode_find_value_result(&cached).unwrap() {
            FindValueOutcome::Value(v) => assert_eq!(v, b"v"),
            FindValueOutcome::Neighbors(_) => panic!("expected caching to have stored the value on b"),
        }
    }

    #[tokio::test]
    async fn empty_candidates_return_immediately() {
        let a_id = NodeId::random();
        let (rpc, _rx) = RpcTransport::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_RPC_TIMEOUT)
            .await
            .unwrap();
        let routing = RwLock::new(RoutingTable::new(a_id, DEFAULT_KSIZE));
        let result = crawl_nodes(
            &rpc,
            &routing,
            a_id,
            NodeId::random(),
            vec![],
            DEFAULT_KSIZE,
            DEFAULT_ALPHA,
        )
        .await;
        assert!(result.is_empty());
    }
}
