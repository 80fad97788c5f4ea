//! Stabilization daemon maintaining every local virtual node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::vnode::{MembershipState, VirtualNode};
use crate::clock::Clock;
use crate::config::BootstrapPeer;
use crate::dht::VnodeMap;
use crate::error::Error;

/// The stabilization runner. Holds only a weak reference to the peer's
/// virtual nodes and stops on its own once the peer is gone.
pub struct Stabilizer {
    vnodes: Weak<VnodeMap>,
    clock: Arc<dyn Clock>,
    period: Duration,
    bootstrap: Vec<BootstrapPeer>,
    rounds: AtomicU64,
}

impl Stabilizer {
    pub fn new(
        vnodes: Weak<VnodeMap>,
        clock: Arc<dyn Clock>,
        period: Duration,
        bootstrap: Vec<BootstrapPeer>,
    ) -> Self {
        Self {
            vnodes,
            clock,
            period,
            bootstrap,
            rounds: AtomicU64::new(0),
        }
    }

    /// Completed rounds since start.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Acquire)
    }

    /// Run stabilization once over every connected or joining virtual node.
    /// Failures are logged and retried next round, never propagated.
    pub async fn tick(&self) {
        let Some(map) = self.vnodes.upgrade() else {
            return;
        };
        let vnodes: Vec<Arc<VirtualNode>> = map.read().await.values().cloned().collect();
        drop(map);

        join_all(vnodes.iter().map(|v| self.maintain(v, &vnodes))).await;
        let round = self.rounds.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(round, vnodes = vnodes.len(), "stabilization round done");
    }

    async fn maintain(&self, vnode: &Arc<VirtualNode>, siblings: &[Arc<VirtualNode>]) {
        if !matches!(
            vnode.state(),
            MembershipState::Connected | MembershipState::Joining
        ) {
            return;
        }
        let node_id = vnode.id();
        if vnode.successor().is_none() {
            // join refuses a vnode that still believes it is connected
            vnode.reenter_discovery();
            if !self.rejoin(vnode, siblings).await {
                return;
            }
        }
        if let Err(e) = vnode.stabilize().await {
            tracing::warn!(?node_id, error = %e, "[stabilize] failed on stabilize");
        }
        if let Err(e) = vnode.check_predecessor().await {
            tracing::warn!(?node_id, error = %e, "[stabilize] failed on check_predecessor");
        }
        match vnode.fix_fingers().await {
            Ok(()) => {}
            Err(e @ Error::LookupExhausted { .. }) => {
                tracing::debug!(?node_id, error = %e, "[stabilize] fix_fingers gave up");
            }
            Err(e) => tracing::warn!(?node_id, error = %e, "[stabilize] failed on fix_fingers"),
        }
        let purged = vnode.purge_expired();
        if purged > 0 {
            tracing::debug!(?node_id, purged, "expired records purged");
        }
    }

    // A vnode without any successor re-enters discovery: configured
    // bootstrap peers first, then connected siblings on this peer.
    async fn rejoin(&self, vnode: &Arc<VirtualNode>, siblings: &[Arc<VirtualNode>]) -> bool {
        let from_siblings = siblings
            .iter()
            .filter(|s| s.id() != vnode.id() && s.is_connected())
            .map(|s| BootstrapPeer::known(s.info().addr(), s.id()));
        let candidates: Vec<BootstrapPeer> =
            self.bootstrap.iter().cloned().chain(from_siblings).collect();
        for candidate in candidates {
            match vnode.join(candidate.addr, candidate.node_id).await {
                Ok(_) => return true,
                Err(e) => tracing::debug!(
                    node_id = ?vnode.id(),
                    bootstrap = %candidate.addr,
                    error = %e,
                    "rejoin attempt failed"
                ),
            }
        }
        tracing::warn!(event = "rejoin_failed", node_id = ?vnode.id(), "No bootstrap candidate answered");
        false
    }

    /// Run stabilization every period until `cancel` fires. A round that
    /// already started is allowed to finish.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep(self.period) => {}
            }
            if self.vnodes.strong_count() == 0 {
                break;
            }
            self.tick().await;
        }
        tracing::debug!(rounds = self.rounds(), "stabilizer stopped");
    }
}
