//! RPC boundary between the ring logic and the network.
//!
//! The ring only needs an at-most-once request/response call with a
//! timeout, plus a way to have inbound requests dispatched to local
//! virtual nodes. [`udp::UdpTransport`] is the production implementation;
//! [`memory::MemoryNetwork`] wires peers together in-process for tests.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{Request, Response};

pub mod memory;
pub mod udp;

/// Why an RPC produced no usable response.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcFailure {
    #[error("timed out")]
    Timeout,
    #[error("unreachable")]
    UnreachablePeer,
    #[error("malformed response")]
    MalformedResponse,
}

/// Receiving side of the transport: turns a request into a response.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Address remote peers reach us at.
    fn local_addr(&self) -> SocketAddr;

    /// Send `request` to the peer at `addr` and wait for its reply, bounded
    /// by the transport's timeout.
    async fn send_rpc(&self, addr: SocketAddr, request: Request) -> Result<Response, RpcFailure>;

    /// Route inbound requests to `handler`. Replaces any earlier handler.
    fn serve(&self, handler: Arc<dyn RpcHandler>) -> crate::Result<()>;
}
