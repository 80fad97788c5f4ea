use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::lookup::Lookup;
use super::{Hop, Request, RequestBody, Response, ResponseBody, Status};
use crate::{
    core::identifier::{Key, NodeID, NodeInfo},
    core::location_table::{LocationTable, TableStatus},
    core::storage::{Record, Storage},
    error::{Error, Result},
    transport::Transport,
};

/// Lifecycle of a virtual node on the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipState {
    Created,
    /// Looking for (or re-establishing) a successor.
    Joining,
    Connected,
    Leaving,
    Left,
}

/// Per-ring tuning shared by every virtual node of a peer.
#[derive(Debug, Clone, Copy)]
pub struct RingParams {
    pub successor_list_len: usize,
    pub max_lookup_hops: usize,
    pub successor_failure_threshold: u32,
}

impl Default for RingParams {
    fn default() -> Self {
        Self {
            successor_list_len: 8,
            max_lookup_hops: 32,
            successor_failure_threshold: 3,
        }
    }
}

#[derive(Debug, Default)]
struct SuccessorFailures {
    node: Option<NodeID>,
    count: u32,
}

/// One logical member of the ring.
///
/// All table accesses go through one lock per virtual node and the lock
/// is never held across an RPC, so a vnode can serve requests while its
/// own stabilization round is waiting on a remote peer.
pub struct VirtualNode {
    info: NodeInfo,
    table: Mutex<LocationTable>,
    state: Mutex<MembershipState>,
    storage: Mutex<Storage>,
    // held for the whole duration of a join; a second join fails fast
    join_guard: tokio::sync::Mutex<()>,
    failures: Mutex<SuccessorFailures>,
    params: RingParams,
    transport: Arc<dyn Transport>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl VirtualNode {
    pub fn new(node_id: NodeID, transport: Arc<dyn Transport>, params: RingParams) -> Self {
        let info = NodeInfo::new(node_id, transport.local_addr());
        let table = LocationTable::new(info, params.successor_list_len);
        Self::from_parts(info, table, MembershipState::Created, transport, params)
    }

    /// Rebuild a virtual node from a persisted table. The node starts out
    /// unconnected; [`VirtualNode::reconnect`] brings it back.
    pub fn restore(
        mut table: LocationTable,
        transport: Arc<dyn Transport>,
        params: RingParams,
    ) -> Self {
        table.rebind(transport.local_addr());
        let info = table.me();
        Self::from_parts(info, table, MembershipState::Created, transport, params)
    }

    fn from_parts(
        info: NodeInfo,
        table: LocationTable,
        state: MembershipState,
        transport: Arc<dyn Transport>,
        params: RingParams,
    ) -> Self {
        Self {
            info,
            table: Mutex::new(table),
            state: Mutex::new(state),
            storage: Mutex::new(Storage::new()),
            join_guard: tokio::sync::Mutex::new(()),
            failures: Mutex::new(SuccessorFailures::default()),
            params,
            transport,
        }
    }

    pub fn id(&self) -> NodeID {
        self.info.node_id
    }

    pub fn info(&self) -> NodeInfo {
        self.info
    }

    pub fn state(&self) -> MembershipState {
        *lock(&self.state)
    }

    fn set_state(&self, next: MembershipState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!(node_id = ?self.info.node_id, from = ?*state, to = ?next, "membership state");
            *state = next;
        }
    }

    /// A connected vnode that lost every successor goes back to Joining,
    /// so the stabilizer can look for the ring again.
    pub fn reenter_discovery(&self) {
        let mut state = lock(&self.state);
        if *state == MembershipState::Connected {
            warn!(
                event = "successor_list_empty",
                node_id = ?self.info.node_id,
                "No successor left, rejoining"
            );
            *state = MembershipState::Joining;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == MembershipState::Connected
    }

    pub fn is_stable(&self) -> bool {
        self.is_connected() && lock(&self.table).is_stable()
    }

    pub fn successor(&self) -> Option<NodeInfo> {
        lock(&self.table).successor()
    }

    pub fn successors(&self) -> Vec<NodeInfo> {
        lock(&self.table).successors().to_vec()
    }

    pub fn predecessor(&self) -> Option<NodeInfo> {
        lock(&self.table).predecessor()
    }

    /// Copy of the routing state, for persistence and inspection.
    pub fn table_snapshot(&self) -> LocationTable {
        lock(&self.table).clone()
    }

    pub fn stored_records(&self) -> usize {
        lock(&self.storage).len()
    }

    pub fn purge_expired(&self) -> usize {
        lock(&self.storage).purge_expired()
    }


    /// Answer an RPC addressed to this virtual node.
    pub async fn handle(&self, body: RequestBody) -> Response {
        match body {
            RequestBody::JoinGetSucc { sender } => self.handle_join_get_succ(sender).await,
            other => self.handle_sync(other),
        }
    }

    async fn handle_join_get_succ(&self, sender: NodeInfo) -> Response {
        if !self.is_connected() {
            return Response::status(Status::NotConnected);
        }
        // The ring may still list the sender when it rejoins, so answer with
        // whatever follows it rather than the sender itself.
        let only_sender = lock(&self.table)
            .successors()
            .iter()
            .all(|s| s.node_id == sender.node_id);
        let found = if only_sender {
            Ok(self.info)
        } else {
            let key = sender.node_id + NodeID::pow2(0);
            self.walk(key, Some(sender.node_id))
                .await
                .map(|(_, successor)| successor)
        };
        match found {
            Ok(successor) => {
                debug!(
                    event = "join_get_succ",
                    node_id = ?self.info.node_id,
                    joining = ?sender.node_id,
                    successor = ?successor.node_id,
                    "Answering join request"
                );
                Response::ok(ResponseBody::Node { node: successor })
            }
            Err(e) => {
                warn!(event = "join_get_succ_failed", node_id = ?self.info.node_id, error = %e);
                Response::status(Status::Rejected)
            }
        }
    }

    // Everything except JOIN_GET_SUCC is answered from local state.
    fn handle_sync(&self, body: RequestBody) -> Response {
        let state = self.state();
        if state == MembershipState::Left {
            return Response::status(Status::UnknownTarget);
        }
        trace!(node_id = ?self.info.node_id, kind = body.kind(), "handle");
        match body {
            RequestBody::FindSuccessor { key } | RequestBody::FindPredecessor { key } => {
                if !matches!(state, MembershipState::Connected | MembershipState::Leaving) {
                    return Response::status(Status::NotConnected);
                }
                match self.local_hop(key, &Default::default()) {
                    Some(hop) => Response::ok(ResponseBody::Hop { hop }),
                    None => Response::status(Status::NotConnected),
                }
            }
            RequestBody::GetPredecessor => Response::ok(ResponseBody::MaybeNode {
                node: self.predecessor(),
            }),
            RequestBody::GetSuccessorList => Response::ok(ResponseBody::Nodes {
                nodes: self.successors(),
            }),
            RequestBody::Notify { node } => {
                if state == MembershipState::Leaving {
                    return Response::status(Status::Rejected);
                }
                let mut table = lock(&self.table);
                if table.offer_predecessor(node) {
                    debug!(
                        event = "predecessor_updated",
                        node_id = ?self.info.node_id,
                        predecessor = ?node.node_id,
                        "Accepted notify"
                    );
                }
                table.learn(node);
                Response::empty()
            }
            RequestBody::Ping => Response::empty(),
            RequestBody::JoinGetSucc { .. } => Response::status(Status::Rejected),
            RequestBody::SuccessorLeaving {
                leaving,
                successors,
            } => {
                info!(event = "successor_leaving", node_id = ?self.info.node_id, ?leaving);
                let status = lock(&self.table).successor_left(leaving, &successors);
                if status == TableStatus::Unstable {
                    self.reenter_discovery();
                }
                Response::empty()
            }
            RequestBody::PredecessorLeaving {
                leaving,
                predecessor,
            } => {
                info!(event = "predecessor_leaving", node_id = ?self.info.node_id, ?leaving);
                let status = lock(&self.table).predecessor_left(leaving, predecessor);
                if status == TableStatus::Unstable {
                    self.reenter_discovery();
                }
                Response::empty()
            }
            RequestBody::Store {
                key,
                record,
                ttl_secs,
            } => {
                debug!(?key, record_len = record.len(), "Store request");
                lock(&self.storage).insert_with_ttl(key, record, Duration::from_secs(ttl_secs));
                Response::empty()
            }
            RequestBody::Fetch { key } => Response::ok(ResponseBody::Record {
                record: lock(&self.storage).get(&key).cloned(),
            }),
        }
    }

    // One lookup step against our own table: either the key falls between
    // us and our successor, or we point at the closest preceding node.
    fn local_hop(&self, key: Key, avoid: &std::collections::HashSet<NodeID>) -> Option<Hop> {
        let table = lock(&self.table);
        let successor = table.first_successor_avoiding(avoid)?;
        if key.is_between_right_incl(&self.info.node_id, &successor.node_id) {
            return Some(Hop::Done {
                predecessor: self.info,
                successor,
            });
        }
        Some(Hop::Next {
            node: table.closest_preceding_avoiding(key, avoid),
        })
    }


    /// Send `body` to `node`. Requests to ourselves never touch the transport.
    async fn call(&self, node: NodeInfo, body: RequestBody) -> Result<Response> {
        if node.node_id == self.info.node_id {
            return Ok(self.handle_sync(body));
        }
        let request = Request::to(node.node_id, body);
        Ok(self.transport.send_rpc(node.addr(), request).await?)
    }

    /// Walk the ring towards `key` and return the pair `(p, s)` with `key`
    /// in `(p, s]`. `skip` is routed around from the first hop.
    async fn walk(&self, key: Key, skip: Option<NodeID>) -> Result<(NodeInfo, NodeInfo)> {
        let mut lookup = Lookup::new(key, self.params.max_lookup_hops);
        if let Some(node_id) = skip {
            lookup.mark_failed(node_id);
        }
        let mut hop = self
            .local_hop(key, lookup.avoid())
            .ok_or_else(|| Error::InvalidState("no successor".to_string()))?;
        loop {
            let node = match hop {
                Hop::Done {
                    predecessor,
                    successor,
                } => {
                    trace!(?key, hops = lookup.hops, path = ?lookup.visited, successor = ?successor.node_id, "lookup done");
                    lock(&self.table).learn(successor);
                    return Ok((predecessor, successor));
                }
                Hop::Next { node } => node,
            };
            lookup.advance(&node)?;
            let reply = self
                .call(node, RequestBody::FindSuccessor { key })
                .await
                .and_then(Response::into_hop);
            hop = match reply {
                Ok(next) => {
                    lock(&self.table).learn(node);
                    next
                }
                Err(e) if e.is_peer_failure() || matches!(e, Error::Rejected(_)) => {
                    debug!(
                        event = "lookup_hop_failed",
                        ?key,
                        peer = ?node.node_id,
                        error = %e,
                        "Routing around unresponsive peer"
                    );
                    lookup.mark_failed(node.node_id);
                    if e.is_peer_failure() {
                        lock(&self.table).forget_finger(node.node_id);
                    }
                    self.local_hop(key, lookup.avoid())
                        .ok_or_else(|| Error::LookupExhausted {
                            key,
                            hops: lookup.hops,
                        })?
                }
                Err(e) => return Err(e),
            };
        }
    }

    /// The virtual node responsible for `key`.
    pub async fn find_successor(&self, key: Key) -> Result<NodeInfo> {
        self.walk(key, None).await.map(|(_, successor)| successor)
    }

    /// The virtual node immediately preceding `key`.
    pub async fn find_predecessor(&self, key: Key) -> Result<NodeInfo> {
        self.walk(key, None).await.map(|(predecessor, _)| predecessor)
    }

    /// Join the ring through the peer at `bootstrap`. `bootstrap_id` may be
    /// `None` when only the address is known.
    pub async fn join(&self, bootstrap: SocketAddr, bootstrap_id: Option<NodeID>) -> Result<NodeInfo> {
        let _guard = self
            .join_guard
            .try_lock()
            .map_err(|_| Error::InvalidState("join already in progress".to_string()))?;
        match self.state() {
            MembershipState::Leaving | MembershipState::Left => {
                return Err(Error::InvalidState("virtual node has left".to_string()))
            }
            MembershipState::Connected => {
                return Err(Error::InvalidState("already connected".to_string()))
            }
            MembershipState::Created | MembershipState::Joining => {}
        }
        self.set_state(MembershipState::Joining);

        let request = Request {
            target: bootstrap_id,
            body: RequestBody::JoinGetSucc { sender: self.info },
        };
        let successor = self
            .transport
            .send_rpc(bootstrap, request)
            .await
            .map_err(Error::from)
            .and_then(Response::into_node)?;
        if successor.node_id == self.info.node_id {
            return Err(Error::InvalidState(format!(
                "identifier {} already present on the ring",
                self.info.node_id
            )));
        }
        {
            let mut table = lock(&self.table);
            table.reset_successors(successor);
            table.learn(successor);
        }
        self.refresh_successor_list(successor).await;
        if let Err(e) = self.notify_successor(successor).await {
            debug!(node_id = ?self.info.node_id, error = %e, "initial notify failed");
        }
        self.set_state(MembershipState::Connected);
        info!(
            event = "vnode_joined",
            node_id = ?self.info.node_id,
            successor = ?successor.node_id,
            %bootstrap,
            "Joined ring"
        );
        Ok(successor)
    }

    /// Become the only member of a fresh ring.
    pub fn self_bootstrap(&self) {
        lock(&self.table).make_self_ring();
        self.set_state(MembershipState::Connected);
        info!(event = "vnode_self_bootstrap", node_id = ?self.info.node_id);
    }

    /// Wire a self-bootstrapped node to its neighbours on a ring made only
    /// of local virtual nodes. `successors` is closest first.
    pub fn link_ring(&self, successors: &[NodeInfo], predecessor: NodeInfo) {
        let mut table = lock(&self.table);
        if let Some(first) = successors.first() {
            table.reset_successors(*first);
        }
        for node in successors {
            table.add_successor(*node);
            table.learn(*node);
        }
        table.set_predecessor(predecessor);
    }

    /// Bring a restored virtual node back on the ring using its persisted
    /// successors. Returns false when none of them answered.
    pub async fn reconnect(&self) -> Result<bool> {
        let _guard = self
            .join_guard
            .try_lock()
            .map_err(|_| Error::InvalidState("join already in progress".to_string()))?;
        if matches!(
            self.state(),
            MembershipState::Leaving | MembershipState::Left
        ) {
            return Err(Error::InvalidState("virtual node has left".to_string()));
        }
        if lock(&self.table).is_self_ring() {
            self.set_state(MembershipState::Connected);
            return Ok(true);
        }
        self.set_state(MembershipState::Joining);
        for candidate in self.successors() {
            match self.call(candidate, RequestBody::Ping).await.and_then(Response::into_empty) {
                Ok(()) => {
                    info!(
                        event = "vnode_reconnected",
                        node_id = ?self.info.node_id,
                        successor = ?candidate.node_id,
                        "Reconnected from persisted table"
                    );
                    self.set_state(MembershipState::Connected);
                    return Ok(true);
                }
                Err(e) => {
                    debug!(peer = ?candidate.node_id, error = %e, "persisted successor is gone");
                    lock(&self.table).remove_peer(candidate.node_id);
                }
            }
        }
        Ok(false)
    }


    /// Verify our successor and tell it about us.
    pub async fn stabilize(&self) -> Result<()> {
        if !matches!(
            self.state(),
            MembershipState::Connected | MembershipState::Joining
        ) {
            return Ok(());
        }
        let Some(successor) = self.successor() else {
            self.set_state(MembershipState::Joining);
            return Ok(());
        };

        if successor.node_id == self.info.node_id {
            // one-node ring: whoever notified us is our successor too
            let mut table = lock(&self.table);
            if let Some(pred) = table.predecessor() {
                if pred.node_id != self.info.node_id {
                    table.add_successor(pred);
                }
            }
            drop(table);
            self.set_state(MembershipState::Connected);
            return Ok(());
        }

        let their_pred = match self
            .call(successor, RequestBody::GetPredecessor)
            .await
            .and_then(Response::into_maybe_node)
        {
            Ok(pred) => {
                self.clear_failures();
                pred
            }
            Err(e) if e.is_peer_failure() => {
                self.successor_failed(successor, &e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut target = successor;
        if let Some(x) = their_pred {
            if x.node_id.is_between(&self.info.node_id, &successor.node_id) {
                lock(&self.table).add_successor(x);
                debug!(
                    event = "successor_updated",
                    node_id = ?self.info.node_id,
                    old = ?successor.node_id,
                    new = ?x.node_id,
                    "Adopted closer successor"
                );
                target = x;
            }
        }

        if !self.refresh_successor_list(target).await && target.node_id != successor.node_id {
            // the newly adopted successor did not answer; stay with the old one
            lock(&self.table).remove_peer(target.node_id);
            target = successor;
        }
        if let Err(e) = self.notify_successor(target).await {
            debug!(node_id = ?self.info.node_id, peer = ?target.node_id, error = %e, "notify failed");
        }
        if self.state() == MembershipState::Joining {
            self.set_state(MembershipState::Connected);
        }
        Ok(())
    }

    async fn notify_successor(&self, successor: NodeInfo) -> Result<()> {
        self.call(successor, RequestBody::Notify { node: self.info })
            .await?
            .into_empty()
    }

    // Pull `from`'s successor list into ours. Returns whether `from` answered.
    async fn refresh_successor_list(&self, from: NodeInfo) -> bool {
        match self
            .call(from, RequestBody::GetSuccessorList)
            .await
            .and_then(Response::into_nodes)
        {
            Ok(nodes) => {
                let mut table = lock(&self.table);
                table.update_successor_list(from, &nodes);
                for node in nodes {
                    table.learn(node);
                }
                true
            }
            Err(e) => {
                debug!(peer = ?from.node_id, error = %e, "get_successor_list failed");
                false
            }
        }
    }

    fn clear_failures(&self) {
        *lock(&self.failures) = SuccessorFailures::default();
    }

    fn successor_failed(&self, successor: NodeInfo, error: &Error) {
        let count = {
            let mut failures = lock(&self.failures);
            if failures.node != Some(successor.node_id) {
                *failures = SuccessorFailures {
                    node: Some(successor.node_id),
                    count: 0,
                };
            }
            failures.count += 1;
            failures.count
        };
        warn!(
            event = "successor_unresponsive",
            node_id = ?self.info.node_id,
            successor = ?successor.node_id,
            count,
            error = %error,
            "Successor did not answer"
        );
        if count < self.params.successor_failure_threshold {
            return;
        }
        self.clear_failures();
        let status = lock(&self.table).remove_peer(successor.node_id);
        let next = self.successor();
        info!(
            event = "successor_dropped",
            node_id = ?self.info.node_id,
            dropped = ?successor.node_id,
            next = ?next.map(|n| n.node_id),
            "Advanced to next successor"
        );
        if status == TableStatus::Unstable {
            self.reenter_discovery();
        }
    }

    /// Ping the predecessor and forget it if it does not answer.
    pub async fn check_predecessor(&self) -> Result<()> {
        let Some(pred) = self.predecessor() else {
            return Ok(());
        };
        if pred.node_id == self.info.node_id {
            return Ok(());
        }
        match self.call(pred, RequestBody::Ping).await.and_then(Response::into_empty) {
            Ok(()) => Ok(()),
            Err(e) if e.is_peer_failure() => {
                let mut table = lock(&self.table);
                if table.predecessor().map(|p| p.node_id) == Some(pred.node_id) {
                    table.clear_predecessor();
                }
                table.forget_finger(pred.node_id);
                drop(table);
                info!(
                    event = "predecessor_cleared",
                    node_id = ?self.info.node_id,
                    predecessor = ?pred.node_id,
                    error = %e,
                    "Predecessor did not answer ping"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh one finger slot, round-robin across calls.
    pub async fn fix_fingers(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let index = lock(&self.table).next_finger_index();
        let start = self.info.node_id.add_pow2(index);
        let successor = self.find_successor(start).await?;
        lock(&self.table).set_finger(index, successor);
        trace!(node_id = ?self.info.node_id, index, finger = ?successor.node_id, "finger fixed");
        Ok(())
    }

    /// Leave the ring: introduce predecessor and successor to each other,
    /// hand our records to the successor, then drop all routing state.
    pub async fn leave(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                MembershipState::Leaving | MembershipState::Left => {
                    return Err(Error::InvalidState("already leaving".to_string()));
                }
                MembershipState::Created => {
                    *state = MembershipState::Left;
                    return Ok(());
                }
                MembershipState::Joining | MembershipState::Connected => {
                    *state = MembershipState::Leaving;
                }
            }
        }
        let (predecessor, successors) = {
            let table = lock(&self.table);
            (table.predecessor(), table.successors().to_vec())
        };
        let me = self.info.node_id;

        if let Some(pred) = predecessor.filter(|p| p.node_id != me) {
            let body = RequestBody::SuccessorLeaving {
                leaving: me,
                successors: successors.clone(),
            };
            if let Err(e) = self.call(pred, body).await.and_then(Response::into_empty) {
                warn!(node_id = ?me, peer = ?pred.node_id, error = %e, "could not inform predecessor");
            }
        }
        if let Some(succ) = successors.first().copied().filter(|s| s.node_id != me) {
            let body = RequestBody::PredecessorLeaving {
                leaving: me,
                predecessor,
            };
            if let Err(e) = self.call(succ, body).await.and_then(Response::into_empty) {
                warn!(node_id = ?me, peer = ?succ.node_id, error = %e, "could not inform successor");
            }
            let records = lock(&self.storage).drain_live();
            let handed = records.len();
            for (key, record, ttl) in records {
                let body = RequestBody::Store {
                    key,
                    record,
                    ttl_secs: ttl.as_secs().max(1),
                };
                if let Err(e) = self.call(succ, body).await.and_then(Response::into_empty) {
                    debug!(?key, error = %e, "record handover failed");
                }
            }
            debug!(node_id = ?me, handed, "records handed to successor");
        }

        lock(&self.table).clear();
        self.set_state(MembershipState::Left);
        info!(event = "vnode_left", node_id = ?me, "Left ring");
        Ok(())
    }


    /// Store `record` at the virtual node responsible for `key`.
    pub async fn put(&self, key: Key, record: Record, ttl: Duration) -> Result<NodeInfo> {
        let owner = self.find_successor(key).await?;
        let body = RequestBody::Store {
            key,
            record,
            ttl_secs: ttl.as_secs().max(1),
        };
        self.call(owner, body).await?.into_empty()?;
        Ok(owner)
    }

    /// Fetch the record for `key` from the virtual node responsible for it.
    pub async fn get(&self, key: Key) -> Result<Option<Record>> {
        let owner = self.find_successor(key).await?;
        self.call(owner, RequestBody::Fetch { key })
            .await?
            .into_record()
    }
}

impl std::fmt::Debug for VirtualNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualNode")
            .field("info", &self.info)
            .field("state", &self.state())
            .finish()
    }
}
