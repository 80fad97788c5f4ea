use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    clock::{Clock, TokioClock},
    config::{BootstrapPeer, DhtConfig},
    core::identifier::{Key, NodeID, NodeInfo},
    core::storage::{Record, DEFAULT_TTL},
    error::{Error, Result},
    persistence::{self, PersistedRingState, PersistedVnode},
    protocol::{Request, Response, Stabilizer, Status, VirtualNode},
    transport::{RpcHandler, Transport},
};

/// Local virtual nodes keyed by identifier.
pub type VnodeMap = RwLock<HashMap<NodeID, Arc<VirtualNode>>>;

/// Routes inbound RPCs to the addressed local virtual node.
pub struct VnodeDispatcher {
    vnodes: Weak<VnodeMap>,
}

impl VnodeDispatcher {
    pub fn new(vnodes: &Arc<VnodeMap>) -> Self {
        Self {
            vnodes: Arc::downgrade(vnodes),
        }
    }
}

#[async_trait]
impl RpcHandler for VnodeDispatcher {
    async fn handle(&self, request: Request) -> Response {
        let Some(map) = self.vnodes.upgrade() else {
            return Response::status(Status::UnknownTarget);
        };
        let vnode = {
            let map = map.read().await;
            match request.target {
                Some(id) => map.get(&id).cloned(),
                None => map.values().find(|v| v.is_connected()).cloned(),
            }
        };
        drop(map);
        match vnode {
            Some(vnode) => vnode.handle(request.body).await,
            None => {
                trace!(requested = ?request.target, kind = request.body.kind(), "no local vnode for request");
                match request.target {
                    Some(_) => Response::status(Status::UnknownTarget),
                    None => Response::status(Status::NotConnected),
                }
            }
        }
    }
}

/// Belief about the size of the whole ring.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkEstimate {
    pub nodes: u64,
    pub vnodes: u64,
}

struct Background {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stabilizer: Arc<Stabilizer>,
}

/// A physical peer: owns the local virtual nodes, drives their lifecycle
/// and persists ring membership.
pub struct PeerNode {
    config: DhtConfig,
    transport: Arc<dyn Transport>,
    vnodes: Arc<VnodeMap>,
    clock: Arc<dyn Clock>,
    estimate: Mutex<NetworkEstimate>,
    has_persistent_data: AtomicBool,
    background: Mutex<Option<Background>>,
}

impl PeerNode {
    pub fn new(config: DhtConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_clock(config, transport, Arc::new(TokioClock))
    }

    pub fn with_clock(config: DhtConfig, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            transport,
            vnodes: Arc::new(RwLock::new(HashMap::new())),
            clock,
            estimate: Mutex::new(NetworkEstimate::default()),
            has_persistent_data: AtomicBool::new(false),
            background: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }


    /// Replace the local virtual nodes with `num_vnodes` fresh identities,
    /// uniformly random over the ring.
    pub async fn create_vnodes(&self) -> Vec<NodeID> {
        let params = self.config.ring_params();
        let mut fresh = HashMap::with_capacity(self.config.num_vnodes);
        while fresh.len() < self.config.num_vnodes {
            let id = NodeID::random();
            fresh
                .entry(id)
                .or_insert_with(|| Arc::new(VirtualNode::new(id, Arc::clone(&self.transport), params)));
        }
        let ids: Vec<NodeID> = fresh.keys().copied().collect();
        *self.vnodes.write().await = fresh;
        self.has_persistent_data.store(false, Ordering::Release);
        info!(event = "vnodes_created", count = ids.len(), addr = %self.addr());
        ids
    }

    /// Host an additional virtual node with a chosen identifier.
    pub async fn add_vnode(&self, node_id: NodeID) -> Arc<VirtualNode> {
        let vnode = Arc::new(VirtualNode::new(
            node_id,
            Arc::clone(&self.transport),
            self.config.ring_params(),
        ));
        self.vnodes.write().await.insert(node_id, Arc::clone(&vnode));
        vnode
    }

    /// Restore virtual nodes from the persisted table. Returns false when
    /// there is no persisted state.
    pub async fn load_vnodes_table(&self) -> Result<bool> {
        let Some(state) = persistence::load(&self.config.vnodes_table_file).await? else {
            return Ok(false);
        };
        if state.vnodes.is_empty() {
            return Ok(false);
        }
        let params = self.config.ring_params();
        let local_ids: Vec<NodeID> = state.vnodes.iter().map(|p| p.node_id).collect();
        let addr = self.addr();
        let restored: HashMap<NodeID, Arc<VirtualNode>> = state
            .vnodes
            .into_iter()
            .map(|mut p| {
                // siblings may have been persisted under a previous address
                for sibling in &local_ids {
                    p.table.relocate(*sibling, addr);
                }
                let vnode = VirtualNode::restore(p.table, Arc::clone(&self.transport), params);
                (p.node_id, Arc::new(vnode))
            })
            .collect();
        let count = restored.len();
        *self.vnodes.write().await = restored;
        self.has_persistent_data.store(true, Ordering::Release);
        info!(
            event = "vnodes_restored",
            count,
            path = %self.config.vnodes_table_file.display(),
            "Loaded persisted ring state"
        );
        Ok(true)
    }

    /// Restore persisted virtual nodes, or create fresh ones when nothing
    /// usable was persisted. Returns whether state was restored.
    pub async fn load_vnodes_and_tables(&self) -> Result<bool> {
        match self.load_vnodes_table().await {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.create_vnodes().await;
                Ok(false)
            }
            Err(Error::PersistenceCorrupt(reason)) => {
                warn!(event = "persistence_corrupt", %reason, "Ignoring persisted ring state");
                self.create_vnodes().await;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Write identities and tables of all live virtual nodes to disk.
    pub async fn hibernate_vnodes_table(&self) -> Result<()> {
        hibernate(&self.vnodes, &self.config.vnodes_table_file).await
    }

    /// Snapshot of the local virtual nodes, ordered by identifier.
    pub async fn vnodes(&self) -> Vec<Arc<VirtualNode>> {
        let mut list: Vec<Arc<VirtualNode>> = self.vnodes.read().await.values().cloned().collect();
        list.sort_by_key(|v| v.id());
        list
    }

    pub async fn vnode(&self, node_id: &NodeID) -> Option<Arc<VirtualNode>> {
        self.vnodes.read().await.get(node_id).cloned()
    }


    /// Connect every local virtual node that is not connected yet.
    ///
    /// Unless `reset` is set, persisted tables are tried first; nodes that
    /// come back this way never contact the bootstrap peers. The others join
    /// through `bootstrap` in order, then through already connected siblings.
    pub async fn join_start(&self, bootstrap: &[BootstrapPeer], reset: bool) -> Result<()> {
        let vnodes = self.vnodes().await;
        if vnodes.is_empty() {
            return Err(Error::InvalidState("no virtual nodes to join".to_string()));
        }
        if !reset && self.has_persistent_data() {
            for vnode in vnodes.iter().filter(|v| !v.is_connected()) {
                match vnode.reconnect().await {
                    Ok(true) => {}
                    Ok(false) => debug!(node_id = ?vnode.id(), "persisted successors unreachable"),
                    Err(e) => debug!(node_id = ?vnode.id(), error = %e, "reconnect skipped"),
                }
            }
        }

        for vnode in vnodes.iter().filter(|v| !v.is_connected()) {
            for peer in bootstrap {
                match vnode.join(peer.addr, peer.node_id).await {
                    Ok(_) => break,
                    Err(e) => debug!(
                        node_id = ?vnode.id(),
                        bootstrap = %peer,
                        error = %e,
                        "join attempt failed"
                    ),
                }
            }
        }

        let siblings: Vec<NodeInfo> = vnodes
            .iter()
            .filter(|v| v.is_connected())
            .map(|v| v.info())
            .collect();
        for vnode in vnodes.iter().filter(|v| !v.is_connected()) {
            for sibling in &siblings {
                if vnode.join(sibling.addr(), Some(sibling.node_id)).await.is_ok() {
                    break;
                }
            }
        }

        let connected = vnodes.iter().filter(|v| v.is_connected()).count();
        info!(
            event = "join_start_done",
            connected,
            total = vnodes.len(),
            reset,
            "Join finished"
        );
        if connected == 0 {
            error!(
                event = "no_bootstrap_available",
                candidates = bootstrap.len(),
                "No virtual node could join the ring"
            );
            return Err(Error::NoBootstrapAvailable);
        }
        Ok(())
    }

    /// Start a new ring made of this peer's virtual nodes only. A single
    /// virtual node becomes its own successor and predecessor; several are
    /// linked into one circle in identifier order.
    pub async fn self_bootstrap(&self) -> Result<()> {
        let vnodes = self.vnodes().await;
        if vnodes.is_empty() {
            return Err(Error::InvalidState("no virtual nodes to bootstrap".to_string()));
        }
        for vnode in &vnodes {
            vnode.self_bootstrap();
        }
        let n = vnodes.len();
        if n > 1 {
            let max = self.config.ring_params().successor_list_len;
            for (i, vnode) in vnodes.iter().enumerate() {
                let successors: Vec<NodeInfo> = (1..n)
                    .take(max)
                    .map(|k| vnodes[(i + k) % n].info())
                    .collect();
                let predecessor = vnodes[(i + n - 1) % n].info();
                vnode.link_ring(&successors, predecessor);
            }
        }
        info!(event = "self_bootstrap", vnodes = n, addr = %self.addr(), "Started a new ring");
        Ok(())
    }

    /// Every local virtual node leaves the ring. Fails only if all of them
    /// had already left.
    pub async fn leave(&self) -> Result<()> {
        let vnodes = self.vnodes().await;
        let mut left = 0usize;
        for vnode in &vnodes {
            match vnode.leave().await {
                Ok(()) => left += 1,
                Err(e) => debug!(node_id = ?vnode.id(), error = %e, "leave skipped"),
            }
        }
        if left == 0 && !vnodes.is_empty() {
            return Err(Error::InvalidState("already left".to_string()));
        }
        Ok(())
    }

    /// Leave the ring and discard all virtual nodes.
    pub async fn destroy_vnodes(&self) -> Result<()> {
        match self.leave().await {
            Ok(()) | Err(Error::InvalidState(_)) => {}
            Err(e) => return Err(e),
        }
        self.vnodes.write().await.clear();
        Ok(())
    }

    /// Estimate ring population from how densely our successors are packed.
    pub async fn estimate_nodes(&self) -> NetworkEstimate {
        let vnodes = self.vnodes().await;
        let samples: Vec<f64> = vnodes
            .iter()
            .filter(|v| v.is_connected())
            .filter_map(|v| {
                let successors = v.successors();
                let last = successors.last()?;
                if last.node_id == v.id() {
                    return None;
                }
                let span = v.id().distance(&last.node_id).fraction_of_ring();
                (span > 0.0).then(|| successors.len() as f64 / span)
            })
            .collect();
        let mut estimate = lock(&self.estimate);
        if samples.is_empty() {
            let local = vnodes.len() as u64;
            *estimate = NetworkEstimate {
                nodes: u64::from(local > 0),
                vnodes: local,
            };
        } else {
            let vnodes_total = samples.iter().sum::<f64>() / samples.len() as f64;
            let per_peer = vnodes.len().max(1) as f64;
            *estimate = NetworkEstimate {
                nodes: (vnodes_total / per_peer).round().max(1.0) as u64,
                vnodes: vnodes_total.round().max(1.0) as u64,
            };
        }
        debug!(nodes = estimate.nodes, vnodes = estimate.vnodes, "network estimate");
        *estimate
    }

    /// Adopt counts computed outside the ring, e.g. by the ranking layer
    /// above it. Replaces whatever `estimate_nodes` last derived.
    pub fn set_estimate(&self, nodes: u64, vnodes: u64) -> NetworkEstimate {
        let estimate = NetworkEstimate { nodes, vnodes };
        *lock(&self.estimate) = estimate;
        debug!(nodes, vnodes, "network estimate set by caller");
        estimate
    }

    pub fn last_estimate(&self) -> NetworkEstimate {
        *lock(&self.estimate)
    }

    /// True iff at least one local virtual node has a successor.
    pub async fn is_connected(&self) -> bool {
        self.vnodes
            .read()
            .await
            .values()
            .any(|v| v.successor().is_some())
    }

    pub fn has_persistent_data(&self) -> bool {
        self.has_persistent_data.load(Ordering::Acquire)
    }

    /// True iff every local virtual node's successor is hosted here, i.e.
    /// this peer is alone on its ring.
    pub async fn on_ring_of_virtual_nodes(&self) -> bool {
        let map = self.vnodes.read().await;
        !map.is_empty()
            && map.values().all(|v| match v.successor() {
                Some(s) => map.contains_key(&s.node_id),
                None => false,
            })
    }


    async fn any_connected(&self) -> Result<Arc<VirtualNode>> {
        self.vnodes()
            .await
            .into_iter()
            .find(|v| v.is_connected())
            .ok_or_else(|| Error::InvalidState("not connected".to_string()))
    }

    /// Store `record` at the virtual node responsible for `key`.
    pub async fn store(&self, key: Key, record: Record) -> Result<NodeInfo> {
        let vnode = self.any_connected().await?;
        let owner = vnode.put(key, record, DEFAULT_TTL).await?;
        debug!(?key, owner = ?owner.node_id, "record stored");
        Ok(owner)
    }

    pub async fn find_by_key(&self, key: Key) -> Result<Option<Record>> {
        self.any_connected().await?.get(key).await
    }


    /// Serve RPCs and start background maintenance: the stabilizer and,
    /// if configured, periodic hibernation.
    pub fn start(&self) -> Result<()> {
        let mut background = lock(&self.background);
        if background.is_some() {
            return Err(Error::InvalidState("already started".to_string()));
        }
        self.transport
            .serve(Arc::new(VnodeDispatcher::new(&self.vnodes)))?;

        let cancel = CancellationToken::new();
        let stabilizer = Arc::new(self.stabilizer());
        let mut tasks = vec![tokio::spawn(
            Arc::clone(&stabilizer).run(cancel.child_token()),
        )];

        if let Some(period) = self.config.hibernate_period {
            let vnodes = Arc::downgrade(&self.vnodes);
            let clock = Arc::clone(&self.clock);
            let path = self.config.vnodes_table_file.clone();
            let cancel = cancel.child_token();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = clock.sleep(period) => {}
                    }
                    let Some(vnodes) = vnodes.upgrade() else { break };
                    if let Err(e) = hibernate(&vnodes, &path).await {
                        warn!(event = "hibernate_failed", error = %e);
                    }
                }
            }));
        }
        info!(event = "peer_started", addr = %self.addr(), period = ?self.config.stabilize_period);
        *background = Some(Background {
            cancel,
            tasks,
            stabilizer,
        });
        Ok(())
    }

    fn stabilizer(&self) -> Stabilizer {
        Stabilizer::new(
            Arc::downgrade(&self.vnodes),
            Arc::clone(&self.clock),
            self.config.stabilize_period,
            self.config.bootstrap.clone(),
        )
    }

    /// Run one stabilization round right now, outside the periodic task.
    pub async fn stabilize_round(&self) {
        self.stabilizer().tick().await;
    }

    /// Rounds completed by the background stabilizer.
    pub fn stabilization_rounds(&self) -> u64 {
        lock(&self.background)
            .as_ref()
            .map(|b| b.stabilizer.rounds())
            .unwrap_or(0)
    }

    /// Stop background work, persist the tables and leave the ring.
    pub async fn stop(&self) -> Result<()> {
        let background = lock(&self.background).take();
        if let Some(background) = background {
            background.cancel.cancel();
            for task in background.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "background task ended abnormally");
                }
            }
        }
        if let Err(e) = self.hibernate_vnodes_table().await {
            error!(event = "hibernate_failed", error = %e, "Could not persist ring state");
        }
        match self.leave().await {
            Ok(()) | Err(Error::InvalidState(_)) => {}
            Err(e) => return Err(e),
        }
        info!(event = "peer_stopped", addr = %self.addr());
        Ok(())
    }

    /// Load or create virtual nodes, serve, and get on a ring: through the
    /// persisted tables or configured bootstrap peers, or as a new ring
    /// when allowed.
    pub async fn boot(&self) -> Result<()> {
        self.load_vnodes_and_tables().await?;
        self.start()?;
        match self.join_start(&self.config.bootstrap, false).await {
            Ok(()) => Ok(()),
            Err(Error::NoBootstrapAvailable) if self.config.self_bootstrap => self.self_bootstrap().await,
            Err(e) => Err(e),
        }
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        if let Some(background) = lock(&self.background).take() {
            background.cancel.cancel();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn hibernate(vnodes: &VnodeMap, path: &Path) -> Result<()> {
    let mut persisted: Vec<PersistedVnode> = vnodes
        .read()
        .await
        .values()
        .filter(|v| v.state() != crate::protocol::MembershipState::Left)
        .map(|v| PersistedVnode {
            node_id: v.id(),
            table: v.table_snapshot(),
        })
        .collect();
    persisted.sort_by_key(|p| p.node_id);
    persistence::save(path, &PersistedRingState::new(persisted)).await
}
