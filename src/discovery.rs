//! LAN UDP beacon discovery. A background task broadcasts a
//! fixed-size `ZRE`-style frame advertising this node's identity and port,
//! and another listens for the same from peers, maintaining a peer table
//! keyed by UUID. A `port=0` frame signals departure.
//!
//! Grounded directly in `kademLAN/discovery.py`'s `Discover`: the frame
//! layout, the join/leave-on-port-zero semantics, and `stop()` broadcasting
//! one departure frame before going quiet are all carried over verbatim.
//! Integration with the rest of the engine follows `ant-networking`'s
//! `Arc<RwLock<..>>`-guarded shared state (`network/driver/event_handler.rs`'s
//! `Arc<RwLock<PeerManager>>`) rather than a channel: the server polls
//! [`Discovery::get_peers`] on its own schedule, exactly as
//! `kademLAN/network.py`'s `get_peers_loop` does.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::BeaconError;

/// ZRE beacon protocol version this crate speaks.
pub const BEACON_VERSION: u8 = 1;
/// Shared LAN discovery port, advertised on by every implementation.
pub const DEFAULT_BEACON_PORT: u16 = 5670;
/// `b"ZRE"` magic prefix identifying a beacon frame.
const MAGIC: [u8; 3] = *b"ZRE";
/// `magic(3) + version(1) + uuid(16) + port(2)`.
const FRAME_LEN: usize = 22;

fn encode_frame(identity: Uuid, port: u16) -> [u8; FRAME_LEN] {
    let mut out = [0u8; FRAME_LEN];
    out[0..3].copy_from_slice(&MAGIC);
    out[3] = BEACON_VERSION;
    out[4..20].copy_from_slice(identity.as_bytes());
    out[20..22].copy_from_slice(&port.to_be_bytes());
    out
}

fn decode_frame(buf: &[u8]) -> Result<(Uuid, u16), BeaconError> {
    if buf.len() != FRAME_LEN {
        return Err(BeaconError::Invalid {
            reason: format!("expected {FRAME_LEN} bytes, got {}", buf.len()),
        });
    }
    if buf[0..3] != MAGIC {
        return Err(BeaconError::Invalid {
            reason: "bad magic".into(),
        });
    }
    let version = buf[3];
    if version != BEACON_VERSION {
        return Err(BeaconError::Invalid {
            reason: format!("unsupported beacon version {version}"),
        });
    }
    let identity = Uuid::from_slice(&buf[4..20])
        .map_err(|e| BeaconError::Invalid { reason: e.to_string() })?;
    let port = u16::from_be_bytes([buf[20], buf[21]]);
    Ok((identity, port))
}

type PeerTable = Arc<Mutex<HashMap<Uuid, SocketAddr>>>;

/// LAN beacon discovery: one UDP socket broadcasting a periodic ZRE frame
/// and listening for the same from other nodes on the LAN.
pub struct Discovery {
    identity: Uuid,
    socket: Arc<UdpSocket>,
    advertise_port: u16,
    broadcast_addr: SocketAddr,
    peers: PeerTable,
    beacon_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

impl Discovery {
    /// Binds the beacon socket at `bind_addr`, advertising `advertise_port`
    /// (the Kademlia RPC socket's port, not the beacon port) to
    /// `broadcast_addr` every `beacon_interval`.
    pub async fn bind(
        bind_addr: SocketAddr,
        advertise_port: u16,
        broadcast_addr: SocketAddr,
        beacon_interval: Duration,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);
        let identity = Uuid::new_v4();
        let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));

        let beacon_task = spawn_beacon_loop(socket.clone(), identity, advertise_port, broadcast_addr, beacon_interval);
        let recv_task = spawn_recv_loop(socket.clone(), peers.clone());

        debug!(%identity, %broadcast_addr, "beacon discovery started");

        Ok(Self {
            identity,
            socket,
            advertise_port,
            broadcast_addr,
            peers,
            beacon_task,
            recv_task,
        })
    }

    pub fn identity(&self) -> Uuid {
        self.identity
    }

    /// Current known peer endpoints.
    pub fn get_peers(&self) -> Vec<SocketAddr> {
        self.peers.lock().expect("peer table lock").values().copied().collect()
    }

    /// Stops broadcasting and listening, first sending one `port=0`
    /// departure frame so peers drop this node promptly
    /// (`kademLAN/discovery.py::stop`).
    pub async fn stop(&self) {
        let frame = encode_frame(self.identity, 0);
        if let Err(e) = self.socket.send_to(&frame, self.broadcast_addr).await {
            warn!("failed to send beacon departure frame: {e}");
        }
        self.beacon_task.abort();
        self.recv_task.abort();
    }

    #[cfg(test)]
    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("bound socket has a local addr")
    }
}

fn spawn_beacon_loop(
    socket: Arc<UdpSocket>,
    identity: Uuid,
    advertise_port: u16,
    broadcast_addr: SocketAddr,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let frame = encode_frame(identity, advertise_port);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = socket.send_to(&frame, broadcast_addr).await {
                warn!("failed to send beacon frame: {e}");
            }
        }
    })
}

fn spawn_recv_loop(socket: Arc<UdpSocket>, peers: PeerTable) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = bytes::BytesMut::zeroed(FRAME_LEN + 16);
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("beacon socket recv error: {e}");
                    continue;
                }
            };

            let (peer_id, port) = match decode_frame(&buf[..n]) {
                Ok(v) => v,
                Err(e) => {
                    trace!(%from, "dropping invalid beacon frame: {e}");
                    continue;
                }
            };

            let mut table = peers.lock().expect("peer table lock");
            if port == 0 {
                if table.remove(&peer_id).is_some() {
                    debug!(%peer_id, "beacon departure, removing peer");
                } else {
                    trace!(%peer_id, "departure beacon for unknown peer, ignoring");
                }
            } else {
                let endpoint = SocketAddr::new(from.ip(), port);
                table.insert(peer_id, endpoint);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn frame_round_trips() {
        let id = Uuid::new_v4();
        let frame = encode_frame(id, 7777);
        let (decoded_id, decoded_port) = decode_frame(&frame).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(decoded_port, 7777);
    }

    #[test]
    fn wrong_magic_is_invalid() {
        let mut frame = encode_frame(Uuid::new_v4(), 1);
        frame[0] = b'X';
        assert!(matches!(decode_frame(&frame), Err(BeaconError::Invalid { .. })));
    }

    #[test]
    fn wrong_version_is_invalid() {
        let mut frame = encode_frame(Uuid::new_v4(), 1);
        frame[3] = 2;
        assert!(matches!(decode_frame(&frame), Err(BeaconError::Invalid { .. })));
    }

    #[tokio::test]
    async fn valid_beacon_records_peer_then_zero_port_removes_it() {
        let a = Discovery::bind("127.0.0.1:0".parse().unwrap(), 9001, addr(0), Duration::from_millis(20))
            .await
            .unwrap();
        let b = Discovery::bind("127.0.0.1:0".parse().unwrap(), 9002, a.local_addr(), Duration::from_millis(20))
            .await
            .unwrap();

        // give b's beacon loop a couple of ticks to reach a
        tokio::time::sleep(Duration::from_millis(100)).await;
        let peers = a.get_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port(), 9002);

        b.stop().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.get_peers().is_empty());
    }

    #[tokio::test]
    async fn zero_port_from_unknown_uuid_is_a_no_op() {
        let a = Discovery::bind("127.0.0.1:0".parse().unwrap(), 9001, addr(0), Duration::from_secs(60))
            .await
            .unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let frame = encode_frame(Uuid::new_v4(), 0);
        socket.send_to(&frame, a.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.get_peers().is_empty());
    }
}
