use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{RpcFailure, RpcHandler, Transport};
use crate::protocol::{Request, Response};

#[derive(Default)]
struct State {
    handlers: HashMap<SocketAddr, Arc<dyn RpcHandler>>,
    down: HashSet<SocketAddr>,
    silent: HashSet<SocketAddr>,
    latency: Option<Duration>,
}

/// In-process network for tests and simulations. Every endpoint created
/// from the same `MemoryNetwork` can reach every other one; peers can be
/// taken down (unreachable) or silenced (requests time out).
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<State>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self, addr: SocketAddr) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            addr,
        })
    }

    pub fn set_down(&self, addr: SocketAddr, down: bool) {
        let mut state = self.lock();
        if down {
            state.down.insert(addr);
        } else {
            state.down.remove(&addr);
        }
    }

    pub fn set_silent(&self, addr: SocketAddr, silent: bool) {
        let mut state = self.lock();
        if silent {
            state.silent.insert(addr);
        } else {
            state.silent.remove(&addr);
        }
    }

    /// Delay applied to every delivered request.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: SocketAddr,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send_rpc(&self, addr: SocketAddr, request: Request) -> Result<Response, RpcFailure> {
        let (handler, latency) = {
            let state = self.network.lock();
            if state.down.contains(&addr) || state.down.contains(&self.addr) {
                return Err(RpcFailure::UnreachablePeer);
            }
            if state.silent.contains(&addr) {
                return Err(RpcFailure::Timeout);
            }
            match state.handlers.get(&addr) {
                Some(handler) => (Arc::clone(handler), state.latency),
                None => return Err(RpcFailure::UnreachablePeer),
            }
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(handler.handle(request).await)
    }

    fn serve(&self, handler: Arc<dyn RpcHandler>) -> crate::Result<()> {
        self.network.lock().handlers.insert(self.addr, handler);
        Ok(())
    }
}
