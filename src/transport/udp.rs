use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, trace, warn};

use super::{RpcFailure, RpcHandler, Transport};
use crate::protocol::{Request, Response, Status};

const MAX_DATAGRAM: usize = 64 * 1024;

/// Request/response correlation token.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcId(u64);

impl RpcId {
    pub fn new_random() -> Self {
        RpcId(rand::rng().next_u64())
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "kind")]
enum Envelope {
    Request { rpc_id: RpcId, request: Request },
    Response { rpc_id: RpcId, response: Response },
}

struct Inner {
    socket: UdpSocket,
    local_addr: SocketAddr,
    timeout: Duration,
    pending: Mutex<HashMap<RpcId, oneshot::Sender<Response>>>,
    handler: RwLock<Option<Arc<dyn RpcHandler>>>,
    shutdown: CancellationToken,
}

/// MessagePack-over-UDP transport. One datagram per request or response;
/// replies are matched to callers by [`RpcId`].
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<Inner>,
    // stops the receive loop once the last clone goes away
    _guard: Arc<DropGuard>,
}

impl UdpTransport {
    /// Bind `addr` and start the receive loop right away, so replies to
    /// early requests are never missed.
    pub async fn bind(addr: SocketAddr, timeout: Duration) -> crate::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let inner = Arc::new(Inner {
            socket,
            local_addr,
            timeout,
            pending: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
            shutdown: CancellationToken::new(),
        });
        let guard = inner.shutdown.clone().drop_guard();
        tokio::spawn(recv_loop(Arc::clone(&inner)));
        debug!(%local_addr, "udp transport bound");
        Ok(Self {
            inner,
            _guard: Arc::new(guard),
        })
    }

    /// Stop the receive loop. Outstanding calls run into their timeout.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    fn forget(&self, rpc_id: &RpcId) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(rpc_id);
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    async fn send_rpc(&self, addr: SocketAddr, request: Request) -> Result<Response, RpcFailure> {
        let rpc_id = RpcId::new_random();
        let kind = request.body.kind();
        let bytes = rmp_serde::to_vec_named(&Envelope::Request { rpc_id, request }).map_err(|e| {
            error!(error = %e, "failed to encode request");
            RpcFailure::MalformedResponse
        })?;

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(rpc_id, tx);

        if let Err(e) = self.inner.socket.send_to(&bytes, addr).await {
            self.forget(&rpc_id);
            debug!(%addr, kind, error = %e, "send failed");
            return Err(RpcFailure::UnreachablePeer);
        }
        trace!(%addr, kind, ?rpc_id, "rpc sent");

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RpcFailure::UnreachablePeer),
            Err(_) => {
                self.forget(&rpc_id);
                debug!(%addr, kind, ?rpc_id, "rpc timed out");
                Err(RpcFailure::Timeout)
            }
        }
    }

    fn serve(&self, handler: Arc<dyn RpcHandler>) -> crate::Result<()> {
        *self.inner.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
        Ok(())
    }
}

async fn recv_loop(inner: Arc<Inner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                debug!(local_addr = %inner.local_addr, "udp transport closed");
                return;
            }
            result = inner.socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src_addr)) => {
                        trace!(bytes = len, %src_addr, "UDP recv");
                        match rmp_serde::from_slice::<Envelope>(&buf[..len]) {
                            Ok(envelope) => dispatch(&inner, envelope, src_addr),
                            Err(e) => {
                                warn!(%src_addr, error = %e, "Error decoding message");
                            }
                        }
                    }
                    Err(e) => {
                        // ICMP port unreachable surfaces here on some platforms
                        debug!(error = %e, "Error receiving message");
                    }
                }
            }
        }
    }
}

fn dispatch(inner: &Arc<Inner>, envelope: Envelope, src_addr: SocketAddr) {
    match envelope {
        Envelope::Response { rpc_id, response } => {
            let waiter = inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&rpc_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => {
                    debug!(%src_addr, ?rpc_id, "response without pending rpc; dropping");
                }
            }
        }
        Envelope::Request { rpc_id, request } => {
            let handler = inner
                .handler
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            let inner = Arc::clone(inner);
            // handlers may issue RPCs of their own, so never run them on the recv loop
            tokio::spawn(async move {
                let response = match handler {
                    Some(handler) => handler.handle(request).await,
                    None => Response::status(Status::UnknownTarget),
                };
                let reply = Envelope::Response { rpc_id, response };
                match rmp_serde::to_vec_named(&reply) {
                    Ok(bytes) => {
                        if let Err(e) = inner.socket.send_to(&bytes, src_addr).await {
                            error!(%src_addr, error = %e, "Failed to send");
                        }
                    }
                    Err(e) => error!(error = %e, "failed to encode response"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestBody, ResponseBody};

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, request: Request) -> Response {
            match request.body {
                RequestBody::Ping => Response::empty(),
                RequestBody::Fetch { key } => Response::ok(ResponseBody::Record {
                    record: Some(key.as_bytes().to_vec()),
                }),
                _ => Response::status(Status::Rejected),
            }
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn request_reaches_handler_and_reply_is_matched() {
        let server = UdpTransport::bind(loopback(), Duration::from_secs(1)).await.unwrap();
        server.serve(Arc::new(Echo)).unwrap();
        let client = UdpTransport::bind(loopback(), Duration::from_secs(1)).await.unwrap();

        let key = crate::NodeID::from_hashed(&"k");
        let response = client
            .send_rpc(server.local_addr(), Request::any(RequestBody::Fetch { key }))
            .await
            .unwrap();
        assert_eq!(response.into_record().unwrap(), Some(key.as_bytes().to_vec()));

        let ping = client
            .send_rpc(server.local_addr(), Request::any(RequestBody::Ping))
            .await
            .unwrap();
        assert_eq!(ping.status, Status::Ok);
    }

    #[tokio::test]
    async fn no_handler_answers_unknown_target() {
        let server = UdpTransport::bind(loopback(), Duration::from_secs(1)).await.unwrap();
        let client = UdpTransport::bind(loopback(), Duration::from_secs(1)).await.unwrap();
        let response = client
            .send_rpc(server.local_addr(), Request::any(RequestBody::Ping))
            .await
            .unwrap();
        assert_eq!(response.status, Status::UnknownTarget);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        // a bound socket nobody reads from
        let silent = UdpSocket::bind(loopback()).await.unwrap();
        let client = UdpTransport::bind(loopback(), Duration::from_millis(50)).await.unwrap();
        let result = client
            .send_rpc(silent.local_addr().unwrap(), Request::any(RequestBody::Ping))
            .await;
        assert_eq!(result, Err(RpcFailure::Timeout));
        assert!(client.inner.pending.lock().unwrap().is_empty());
    }
}
