//! Server orchestration: wires the routing table, storage,
//! protocol handlers, RPC transport, and LAN beacon discovery together,
//! and exposes the public `set`/`get`/`bootstrap`/`refresh_table` surface.
//!
//! Grounded directly in `kademLAN/network.py::Server` for the operations
//! and scheduling; task/channel layering follows `ant-networking`'s
//! single-event-loop-plus-`Arc<RwLock<..>>` pattern
//! (`network/driver/event_handler.rs`'s `EventProcessor`), generalized so
//! independent async callers (the `set`/`get` public methods, the inbound
//! request loop, and the periodic scheduled tasks) can all touch the
//! shared routing table and storage without a single actor bottleneck.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::crawl::{self, ValueLookupOutcome};
use crate::discovery::Discovery;
use crate::error::KadError;
use crate::id::NodeId;
use crate::node::Node;
use crate::protocol::Protocol;
use crate::routing::{ChallengeResult, RoutingTable};
use crate::rpc::codec::Value;
use crate::rpc::{InboundRequest, RpcTransport};
use crate::storage::Storage;

/// The bootstrap callback the caller supplies to [`Server::start`]. It
/// fires at most once, on the first successful bootstrap.
pub type BootstrapCallback = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    config: ServerConfig,
    local_id: NodeId,
    rpc: Arc<RpcTransport>,
    routing: RwLock<RoutingTable>,
    storage: RwLock<Storage>,
    protocol: Protocol,
    discovery: Discovery,
    discovered_peers: Mutex<HashSet<SocketAddr>>,
    bootstrapped: AtomicBool,
    bootstrap_cb: Mutex<Option<BootstrapCallback>>,
}

/// A running Kademlia node: routing table, storage, RPC transport, and
/// LAN beacon discovery, plus the background tasks that keep them alive.
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Binds the RPC and beacon sockets, starts the background tasks, and
    /// returns the running server. `on_bootstrap` fires once, the first
    /// time a bootstrap (explicit or LAN-discovery-triggered) succeeds.
    pub async fn start(
        config: ServerConfig,
        on_bootstrap: impl FnOnce() + Send + 'static,
    ) -> std::io::Result<Self> {
        let local_id = config.node_id.unwrap_or_else(NodeId::random);
        let (rpc, requests) = RpcTransport::bind(config.bind_addr, config.rpc_timeout).await?;
        let rpc = Arc::new(rpc);
        let rpc_port = rpc.local_addr()?.port();

        let beacon_bind: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.beacon_port);
        let beacon_broadcast: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), config.beacon_port);
        let discovery = Discovery::bind(beacon_bind, rpc_port, beacon_broadcast, config.beacon_interval).await?;

        let routing = RwLock::new(RoutingTable::new(local_id, config.ksize).with_refresh_interval(config.refresh_interval));
        let storage = RwLock::new(Storage::new(config.storage_ttl, config.storage_capacity));
        let protocol = Protocol::new(local_id, config.ksize);

        let inner = Arc::new(Inner {
            config,
            local_id,
            rpc,
            routing,
            storage,
            protocol,
            discovery,
            discovered_peers: Mutex::new(HashSet::new()),
            bootstrapped: AtomicBool::new(false),
            bootstrap_cb: Mutex::new(Some(Box::new(on_bootstrap))),
        });

        spawn_request_loop(inner.clone(), requests);
        spawn_discovery_poll(inner.clone());
        spawn_refresh_loop(inner.clone());

        info!(local_id = %local_id, port = rpc_port, "server started");
        Ok(Self { inner })
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.rpc.local_addr()
    }

    /// `set(key, value)`: crawls for the nearest nodes to
    /// `digest(key)` and stores on each; succeeds iff at least one store
    /// succeeded.
    pub async fn set(&self, key: &[u8], value: Vec<u8>) -> Result<bool, KadError> {
        let dkey = NodeId::digest(key);
        let nearest = {
            let routing = self.inner.routing.read().await;
            routing.find_neighbors(&dkey, self.inner.config.ksize, &[])
        };
        if nearest.is_empty() {
            warn!(key = %dkey, "no known neighbors to set key");
            return Err(KadError::NoNeighbors);
        }

        let nodes = crawl::crawl_nodes(
            &self.inner.rpc,
            &self.inner.routing,
            self.inner.local_id,
            dkey,
            nearest,
            self.inner.config.ksize,
            self.inner.config.alpha,
        )
        .await;

        debug!(key = %dkey, targets = nodes.len(), "storing on nearest nodes");
        let calls = nodes.iter().map(|node| {
            let rpc = self.inner.rpc.clone();
            let local_id = self.inner.local_id;
            let value = value.clone();
            async move {
                let args = Value::Tuple(vec![Value::node_id(&local_id), Value::node_id(&dkey), Value::Bytes(value)]);
                rpc.call(node.addr, "store", args).await.map(|v| v.as_bool().unwrap_or(false)).unwrap_or(false)
            }
        });
        let results = join_all(calls).await;
        Ok(results.into_iter().any(|ok| ok))
    }

    /// `get(key)`: crawls for the value, returning `NotFound`
    /// if the crawl terminates without one.
    pub async fn get(&self, key: &[u8]) -> Result<Vec<u8>, KadError> {
        let dkey = NodeId::digest(key);
        let nearest = {
            let routing = self.inner.routing.read().await;
            routing.find_neighbors(&dkey, self.inner.config.ksize, &[])
        };
        if nearest.is_empty() {
            warn!(key = %dkey, "no known neighbors to get key");
            return Err(KadError::NoNeighbors);
        }

        let outcome = crawl::crawl_value(
            &self.inner.rpc,
            &self.inner.routing,
            self.inner.local_id,
            dkey,
            nearest,
            self.inner.config.ksize,
            self.inner.config.alpha,
        )
        .await;
        match outcome {
            ValueLookupOutcome::Value(v) => Ok(v),
            ValueLookupOutcome::NotFound => Err(KadError::NotFound),
        }
    }

    /// `bootstrap(addrs)`: pings each address to learn its id,
    /// then runs a `NodeSpiderCrawl` over the responders. Fires the
    /// bootstrap callback once if any responder was found.
    pub async fn bootstrap(&self, addrs: Vec<SocketAddr>) -> Vec<Node> {
        let responders = ping_all(&self.inner, &addrs).await;
        if responders.is_empty() {
            return vec![];
        }

        let found = crawl::crawl_nodes(
            &self.inner.rpc,
            &self.inner.routing,
            self.inner.local_id,
            self.inner.local_id,
            responders,
            self.inner.config.ksize,
            self.inner.config.alpha,
        )
        .await;

        fire_bootstrap_callback_once(&self.inner);
        found
    }

    /// `refresh_table`: runs a lookup for a random id in
    /// every idle bucket, then republishes storage entries older than the
    /// republish interval via `set` (treated as re-broadcast).
    pub async fn refresh_table(&self) {
        let refresh_ids = {
            let routing = self.inner.routing.read().await;
            routing.get_refresh_ids()
        };
        for id in refresh_ids {
            let nearest = {
                let routing = self.inner.routing.read().await;
                routing.find_neighbors(&id, self.inner.config.alpha, &[])
            };
            if nearest.is_empty() {
                continue;
            }
            crawl::crawl_nodes(
                &self.inner.rpc,
                &self.inner.routing,
                self.inner.local_id,
                id,
                nearest,
                self.inner.config.ksize,
                self.inner.config.alpha,
            )
            .await;
        }

        let stale = {
            let storage = self.inner.storage.read().await;
            storage.iter_older_than(self.inner.config.republish_interval.as_secs())
        };
        for (key_digest, value) in stale {
            if let Err(e) = self.set_digest(key_digest, value).await {
                warn!(key = %key_digest, "republish failed: {e}");
            }
        }
    }

    /// Republish entry point keyed by an already-computed digest, since
    /// republish doesn't have the original key bytes, only the stored
    /// digest (`kademLAN/network.py::refreshTable`).
    async fn set_digest(&self, dkey: NodeId, value: Vec<u8>) -> Result<bool, KadError> {
        let nearest = {
            let routing = self.inner.routing.read().await;
            routing.find_neighbors(&dkey, self.inner.config.ksize, &[])
        };
        if nearest.is_empty() {
            return Err(KadError::NoNeighbors);
        }
        let nodes = crawl::crawl_nodes(
            &self.inner.rpc,
            &self.inner.routing,
            self.inner.local_id,
            dkey,
            nearest,
            self.inner.config.ksize,
            self.inner.config.alpha,
        )
        .await;
        let calls = nodes.iter().map(|node| {
            let rpc = self.inner.rpc.clone();
            let local_id = self.inner.local_id;
            let value = value.clone();
            async move {
                let args = Value::Tuple(vec![Value::node_id(&local_id), Value::node_id(&dkey), Value::Bytes(value)]);
                rpc.call(node.addr, "store", args).await.map(|v| v.as_bool().unwrap_or(false)).unwrap_or(false)
            }
        });
        let results = join_all(calls).await;
        Ok(results.into_iter().any(|ok| ok))
    }

    /// Up to `ksize` neighbors of the local id, as `(ip, port)` pairs
    /// suitable for a future `bootstrap` call (`kademLAN/network.py
    /// ::bootstrappableNeighbors`).
    pub async fn bootstrappable_neighbors(&self) -> Vec<(String, u16)> {
        let routing = self.inner.routing.read().await;
        routing
            .find_neighbors(&self.inner.local_id, self.inner.config.ksize, &[])
            .into_iter()
            .map(|n| (n.addr.ip().to_string(), n.addr.port()))
            .collect()
    }

    /// Queries every bootstrappable neighbor's `stun` handler and returns
    /// the distinct external addresses they observed us at
    /// (`kademLAN/network.py::inetVisibleIP`).
    pub async fn inet_visible_ip(&self) -> Vec<String> {
        let neighbors = {
            let routing = self.inner.routing.read().await;
            routing.find_neighbors(&self.inner.local_id, self.inner.config.ksize, &[])
        };
        let calls = neighbors.iter().map(|n| {
            let rpc = self.inner.rpc.clone();
            async move {
                let result = rpc.call(n.addr, "stun", Value::Tuple(vec![])).await.ok()?;
                let parts = result.as_tuple()?;
                let ip = std::str::from_utf8(parts.first()?.as_bytes()?).ok()?.to_string();
                Some(ip)
            }
        });
        let mut ips: Vec<String> = join_all(calls).await.into_iter().flatten().collect();
        ips.sort();
        ips.dedup();
        ips
    }

    /// Bit-exact stable encoding of `{ksize, alpha, local_id, neighbors}`
    /// . `port` is deliberately not part of the blob — see
    /// [`load_state`](Self::load_state) and DESIGN.md's note on the
    /// source's `load_state`/`port` ambiguity.
    pub async fn save_state(&self) -> Vec<u8> {
        let neighbors = self.bootstrappable_neighbors().await;
        let state = PersistedState {
            ksize: self.inner.config.ksize,
            alpha: self.inner.config.alpha,
            id: self.inner.local_id,
            neighbors,
        };
        bincode::serialize(&state).expect("persisted state is always serializable")
    }

    /// Decodes a blob written by [`save_state`](Self::save_state) into the
    /// config fields and neighbor list to bootstrap from. The caller
    /// supplies `port` separately and builds a fresh [`ServerConfig`],
    /// resolving the source's `load_state`/`port` ambiguity by
    /// never folding a bind port into the persisted schema at all.
    pub fn load_state(bytes: &[u8]) -> Result<PersistedState, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Stops the background tasks, the beacon, and closes the RPC socket.
    /// Outstanding RPCs resolve with `ShuttingDown`.
    pub async fn stop(&self) {
        self.inner.rpc.shut_down();
        self.inner.discovery.stop().await;
    }
}

/// The schema persisted by [`Server::save_state`] / restored by
/// [`Server::load_state`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub ksize: usize,
    pub alpha: usize,
    pub id: NodeId,
    pub neighbors: Vec<(String, u16)>,
}

impl PersistedState {
    /// The `neighbors` list resolved to [`SocketAddr`]s, skipping any that
    /// fail to parse (a malformed persisted entry shouldn't abort loading
    /// the rest).
    pub fn neighbor_addrs(&self) -> Vec<SocketAddr> {
        self.neighbors
            .iter()
            .filter_map(|(ip, port)| format!("{ip}:{port}").parse().ok())
            .collect()
    }
}

async fn ping_all(inner: &Arc<Inner>, addrs: &[SocketAddr]) -> Vec<Node> {
    let calls = addrs.iter().map(|&addr| {
        let rpc = inner.rpc.clone();
        let local_id = inner.local_id;
        async move {
            let args = Value::Tuple(vec![Value::node_id(&local_id)]);
            debug!(%addr, "pinging peer");
            match rpc.call(addr, "ping", args).await {
                Ok(result) => result.to_node_id().ok().map(|id| Node::new(id, addr)),
                Err(_) => None,
            }
        }
    });
    let responders: Vec<Node> = join_all(calls).await.into_iter().flatten().collect();
    debug!(pinged = addrs.len(), responded = responders.len(), "bootstrap ping sweep done");
    responders
}

fn fire_bootstrap_callback_once(inner: &Arc<Inner>) {
    if inner.bootstrapped.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
        if let Some(cb) = inner.bootstrap_cb.lock().expect("bootstrap cb lock").take() {
            info!("bootstrap callback fired");
            cb();
        }
    }
}

/// Resolves an inbound handler's liveness challenge by pinging the head
/// through the same RPC transport the server uses, mirroring
/// `ant-networking::bootstrap`'s pattern of a component scheduling its own
/// follow-up work (DESIGN.md).
fn spawn_challenge_resolution(inner: Arc<Inner>, challenge: crate::routing::PendingChallenge) {
    tokio::spawn(async move {
        let args = Value::Tuple(vec![Value::node_id(&challenge.head.id)]);
        let alive = inner.rpc.call(challenge.head.addr, "ping", args).await.is_ok();
        let result = if alive { ChallengeResult::HeadAlive } else { ChallengeResult::HeadDead };
        inner.routing.write().await.resolve_challenge(challenge, result);
    });
}

fn spawn_request_loop(inner: Arc<Inner>, mut requests: tokio::sync::mpsc::Receiver<InboundRequest>) {
    tokio::spawn(async move {
        while let Some(req) = requests.recv().await {
            let inner = inner.clone();
            tokio::spawn(async move {
                handle_request(&inner, req).await;
            });
        }
    });
}

async fn handle_request(inner: &Arc<Inner>, req: InboundRequest) {
    let (result, challenge) = {
        let mut routing = inner.routing.write().await;
        let mut storage = inner.storage.write().await;
        match inner.protocol.dispatch(&req.method, &req.args, req.from, &mut routing, &mut storage) {
            Ok((value, challenge)) => (value, challenge),
            Err(e) => {
                warn!(method = %req.method, from = %req.from, "{e}");
                (Value::Error(e.to_string()), None)
            }
        }
    };

    if let Some(challenge) = challenge {
        spawn_challenge_resolution(inner.clone(), challenge);
    }

    if let Err(e) = inner.rpc.respond(req.from, req.rpc_id, result).await {
        warn!(to = %req.from, "failed to send rpc response: {e}");
    }
}

fn spawn_discovery_poll(inner: Arc<Inner>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.get_peers_interval);
        loop {
            ticker.tick().await;
            let peers = inner.discovery.get_peers();
            let newly_seen: Vec<SocketAddr> = {
                let mut seen = inner.discovered_peers.lock().expect("discovered peers lock");
                let fresh: Vec<SocketAddr> = peers.into_iter().filter(|p| !seen.contains(p)).collect();
                seen.extend(fresh.iter().copied());
                fresh
            };
            if newly_seen.is_empty() {
                continue;
            }
            info!(count = newly_seen.len(), "discovered new LAN peers, bootstrapping");
            let responders = ping_all(&inner, &newly_seen).await;
            if responders.is_empty() {
                continue;
            }
            crawl::crawl_nodes(
                &inner.rpc,
                &inner.routing,
                inner.local_id,
                inner.local_id,
                responders,
                inner.config.ksize,
                inner.config.alpha,
            )
            .await;
            fire_bootstrap_callback_once(&inner);
        }
    });
}

fn spawn_refresh_loop(inner: Arc<Inner>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.refresh_interval);
        loop {
            ticker.tick().await;
            let server = Server { inner: inner.clone() };
            server.refresh_table().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// A config bound to ephemeral ports throughout, so parallel test
    /// servers never collide on the shared LAN beacon port.
    fn free_config() -> ServerConfig {
        let mut config = ServerConfig::default().with_bind_addr("127.0.0.1:0".parse().unwrap());
        config.beacon_port = 0;
        config
    }

    #[tokio::test]
    async fn get_on_empty_routing_table_is_no_neighbors_without_rpc() {
        let config = free_config();
        let (tx, _rx) = tokio::sync::oneshot::channel::<()>();
        let server = Server::start(config, move || {
            let _ = tx.send(());
        })
        .await
        .unwrap();
        let result = server.get(b"x").await;
        assert!(matches!(result, Err(KadError::NoNeighbors)));
        server.stop().await;
    }

    #[tokio::test]
    async fn two_servers_bootstrap_and_round_trip_a_value() {
        let a = Server::start(free_config(), || {}).await.unwrap();
        let b = Server::start(free_config(), || {}).await.unwrap();

        let a_addr = a.local_addr().unwrap();
        let found = b.bootstrap(vec![a_addr]).await;
        assert!(found.iter().any(|n| n.id == a.local_id()));

        let ok = b.set(b"hello", b"world".to_vec()).await;
        assert!(ok.is_ok());
        assert!(ok.unwrap());

        let value = a.get(b"hello").await;
        assert_eq!(value.unwrap(), b"world");

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn save_state_then_load_state_round_trips() {
        let server = Server::start(free_config(), || {}).await.unwrap();
        let blob = server.save_state().await;
        let restored = Server::load_state(&blob).unwrap();
        assert_eq!(restored.ksize, 20);
        assert_eq!(restored.alpha, 3);
        assert_eq!(restored.id, server.local_id());
        server.stop().await;
    }

    #[tokio::test]
    async fn unknown_method_gets_a_prompt_error_response_not_a_timeout() {
        let server = Server::start(free_config(), || {}).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (client, _rx) = RpcTransport::bind("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        let result = tokio::time::timeout(
            Duration::from_millis(500),
            client.call(addr, "frobnicate", Value::Tuple(vec![])),
        )
        .await
        .expect("response arrives well within the rpc timeout")
        .expect("the transport resolves the call, even though the method was unknown");
        assert!(result.is_error());

        server.stop().await;
    }

    #[tokio::test]
    async fn bootstrap_callback_fires_once() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let config = free_config();
        let server = Server::start(config, move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        let other = Server::start(free_config(), || {}).await.unwrap();
        let other_addr = other.local_addr().unwrap();

        server.bootstrap(vec![other_addr]).await;
        server.bootstrap(vec![other_addr]).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        server.stop().await;
        other.stop().await;
    }
}
