//! Connectionless request/response RPC over UDP, with rpc_id correlation
//! and per-call timeouts.

pub mod codec;

use crate::error::RpcError;
use codec::{Frame, RpcId, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

/// Practical LAN UDP payload bound. Oversize payloads are rejected before
/// being sent rather than fragmented (datagrams exceeding the
/// MTU are not supported).
pub const MAX_DATAGRAM_SIZE: usize = 1400;

/// An inbound request awaiting a handler's response.
#[derive(Debug)]
pub struct InboundRequest {
    pub from: SocketAddr,
    pub rpc_id: RpcId,
    pub method: String,
    pub args: Value,
}

type PendingCalls = Arc<Mutex<HashMap<RpcId, oneshot::Sender<Value>>>>;

/// The UDP RPC transport: one socket, one owner. `call` issues requests
/// and awaits matching responses; inbound requests are handed to whoever
/// is reading `requests()`.
pub struct RpcTransport {
    socket: Arc<UdpSocket>,
    pending: PendingCalls,
    timeout: Duration,
}

impl RpcTransport {
    /// Binds a UDP socket and starts the background receive loop. Returns
    /// the transport plus a channel of inbound requests for the caller
    /// (the protocol layer) to answer via [`RpcTransport::respond`].
    pub async fn bind(
        addr: SocketAddr,
        timeout: Duration,
    ) -> std::io::Result<(Self, mpsc::Receiver<InboundRequest>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let (req_tx, req_rx) = mpsc::channel(128);

        spawn_recv_loop(socket.clone(), pending.clone(), req_tx);

        Ok((
            Self {
                socket,
                pending,
                timeout,
            },
            req_rx,
        ))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Issues `method(args)` to `addr` and awaits a matching response, or
    /// `RpcError::Timeout` after the configured timeout. Exactly one
    /// outstanding future per rpc_id.
    pub async fn call(&self, addr: SocketAddr, method: &str, args: Value) -> Result<Value, RpcError> {
        let rpc_id = crate::id::NodeId::random().as_bytes().to_owned();
        let frame = Frame::Request {
            rpc_id,
            method: method.to_string(),
            args,
        };
        let bytes = frame.encode();
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(RpcError::MessageTooLarge {
                size: bytes.len(),
                mtu: MAX_DATAGRAM_SIZE,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(rpc_id, tx);

        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            self.pending.lock().expect("pending lock").remove(&rpc_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(RpcError::ShuttingDown),
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&rpc_id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Sends a response for a previously received request.
    pub async fn respond(&self, addr: SocketAddr, rpc_id: RpcId, result: Value) -> Result<(), RpcError> {
        let frame = Frame::Response { rpc_id, result };
        let bytes = frame.encode();
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(RpcError::MessageTooLarge {
                size: bytes.len(),
                mtu: MAX_DATAGRAM_SIZE,
            });
        }
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    /// Resolves every outstanding call with `ShuttingDown`.
    pub fn shut_down(&self) {
        let mut pending = self.pending.lock().expect("pending lock");
        for (_, tx) in pending.drain() {
            drop(tx); // dropping resolves the receiver with RecvError -> ShuttingDown
        }
    }
}

fn spawn_recv_loop(
    socket: Arc<UdpSocket>,
    pending: PendingCalls,
    requests: mpsc::Sender<InboundRequest>,
) {
    tokio::spawn(async move {
        let mut buf = bytes::BytesMut::zeroed(MAX_DATAGRAM_SIZE + 64);
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("rpc socket recv error: {e}");
                    continue;
                }
            };

            let frame = match Frame::decode(&buf[..n]) {
                Ok(f) => f,
                Err(e) => {
                    warn!(%from, "malformed rpc datagram: {e}");
                    continue;
                }
            };

            match frame {
                Frame::Response { rpc_id, result } => {
                    let sender = pending.lock().expect("pending lock").remove(&rpc_id);
                    match sender {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => trace!(from = %from, "discarding unknown or late rpc response"),
                    }
                }
                Frame::Request {
                    rpc_id,
                    method,
                    args,
                } => {
                    if requests
                        .send(InboundRequest {
                            from,
                            rpc_id,
                            method,
                            args,
                        })
                        .await
                        .is_err()
                    {
                        break; // handler side has shut down
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_times_out_when_nobody_answers() {
        let (a, _rx) = RpcTransport::bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(50))
            .await
            .unwrap();
        let dead_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = a.call(dead_addr, "ping", Value::Tuple(vec![])).await;
        assert!(matches!(result, Err(RpcError::Timeout)));
    }

    #[tokio::test]
    async fn request_reaches_handler_and_response_reaches_caller() {
        let (client, _client_rx) =
            RpcTransport::bind("127.0.0.1:0".parse().unwrap(), Duration::from_secs(2))
                .await
                .unwrap();
        let (server, mut server_rx) =
            RpcTransport::bind("127.0.0.1:0".parse().unwrap(), Duration::from_secs(2))
                .await
                .unwrap();
        let server_addr = server.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let req = server_rx.recv().await.expect("request");
            assert_eq!(req.method, "ping");
            server
                .respond(req.from, req.rpc_id, Value::Bool(true))
                .await
                .unwrap();
        });

        let result = client
            .call(server_addr, "ping", Value::Tuple(vec![]))
            .await
            .unwrap();
        assert_eq!(result, Value::Bool(true));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected_without_sending() {
        let (client, _rx) = RpcTransport::bind("127.0.0.1:0".parse().unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        let huge = Value::Bytes(vec![0u8; MAX_DATAGRAM_SIZE * 2]);
        let result = client.call("127.0.0.1:1".parse().unwrap(), "store", huge).await;
        assert!(matches!(result, Err(RpcError::MessageTooLarge { .. })));
    }
}
