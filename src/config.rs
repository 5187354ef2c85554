//! Server configuration: a plain struct with a `Default` impl, in the style
//! of `ant-networking::config::NetworkConfig`.

use crate::id::NodeId;
use crate::routing::DEFAULT_KSIZE;
use crate::storage::DEFAULT_TTL;
use std::net::SocketAddr;
use std::time::Duration;

/// Default RPC round-trip timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bucket refresh interval.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
/// Default lookup parallelism (`alpha` in the Kademlia paper).
pub const DEFAULT_ALPHA: usize = 3;
/// Default LAN beacon broadcast interval.
pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(1);
/// Default beacon UDP port, shared by every node on the LAN.
pub const DEFAULT_BEACON_PORT: u16 = 5670;
/// Default interval at which discovered peers are polled for bootstrap.
pub const DEFAULT_GET_PEERS_INTERVAL: Duration = Duration::from_secs(5);

/// Construction-time configuration for a [`crate::server::Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the Kademlia RPC UDP socket on.
    pub bind_addr: SocketAddr,
    /// Bucket capacity and candidate-list size.
    pub ksize: usize,
    /// Lookup parallelism.
    pub alpha: usize,
    /// Local node id; a random id is generated if unset.
    pub node_id: Option<NodeId>,
    /// Per-RPC-call timeout.
    pub rpc_timeout: Duration,
    /// How often idle buckets are refreshed.
    pub refresh_interval: Duration,
    /// How often storage entries are republished (tied to `refresh_table`).
    pub republish_interval: Duration,
    /// Storage entry time-to-live.
    pub storage_ttl: Duration,
    /// Optional bound on the number of stored entries.
    pub storage_capacity: Option<usize>,
    /// LAN beacon broadcast interval.
    pub beacon_interval: Duration,
    /// LAN beacon UDP port.
    pub beacon_port: u16,
    /// How often newly discovered LAN peers are polled.
    pub get_peers_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().expect("valid default addr"),
            ksize: DEFAULT_KSIZE,
            alpha: DEFAULT_ALPHA,
            node_id: None,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            republish_interval: DEFAULT_REFRESH_INTERVAL,
            storage_ttl: DEFAULT_TTL,
            storage_capacity: None,
            beacon_interval: DEFAULT_BEACON_INTERVAL,
            beacon_port: DEFAULT_BEACON_PORT,
            get_peers_interval: DEFAULT_GET_PEERS_INTERVAL,
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_node_id(mut self, id: NodeId) -> Self {
        self.node_id = Some(id);
        self
    }

    pub fn with_ksize(mut self, ksize: usize) -> Self {
        self.ksize = ksize;
        self
    }

    pub fn with_alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha;
        self
    }
}
