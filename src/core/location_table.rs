use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::identifier::{NodeID, NodeInfo, ID_BITS};

/// One finger per bit of the identifier space.
pub const FINGER_COUNT: usize = ID_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    /// At least one successor is known.
    Stable,
    /// The successor list is empty; the owner has to rediscover the ring.
    Unstable,
}

/// Routing state of one virtual node: predecessor, closest-first successor
/// list and finger table.
///
/// Entries never carry the owner's own identifier, except for the one-node
/// ring built by [`LocationTable::make_self_ring`], where the owner is its
/// own successor and predecessor until any other node shows up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationTable {
    me: NodeInfo,
    max_successors: usize,
    predecessor: Option<NodeInfo>,
    successors: Vec<NodeInfo>,
    fingers: Vec<Option<NodeInfo>>,
    #[serde(skip)]
    next_finger: usize,
}

impl LocationTable {
    pub fn new(me: NodeInfo, max_successors: usize) -> Self {
        Self {
            me,
            max_successors: max_successors.max(1),
            predecessor: None,
            successors: Vec::with_capacity(max_successors),
            fingers: vec![None; FINGER_COUNT],
            next_finger: 0,
        }
    }

    pub fn me(&self) -> NodeInfo {
        self.me
    }

    pub fn predecessor(&self) -> Option<NodeInfo> {
        self.predecessor
    }

    /// Immediate successor, the head of the successor list.
    pub fn successor(&self) -> Option<NodeInfo> {
        self.successors.first().copied()
    }

    pub fn successors(&self) -> &[NodeInfo] {
        &self.successors
    }

    pub fn fingers(&self) -> &[Option<NodeInfo>] {
        &self.fingers
    }

    pub fn finger(&self, index: usize) -> Option<NodeInfo> {
        self.fingers.get(index).copied().flatten()
    }

    pub fn status(&self) -> TableStatus {
        if self.successors.is_empty() {
            TableStatus::Unstable
        } else {
            TableStatus::Stable
        }
    }

    /// Both neighbours are known.
    pub fn is_stable(&self) -> bool {
        !self.successors.is_empty() && self.predecessor.is_some()
    }

    pub fn is_self_ring(&self) -> bool {
        self.successors.len() == 1 && self.successors[0].node_id == self.me.node_id
    }

    /// Point the table at a new local endpoint, e.g. after a restart on another port.
    pub fn rebind(&mut self, addr: SocketAddr) {
        self.me = NodeInfo::new(self.me.node_id, addr);
        self.relocate(self.me.node_id, addr);
    }

    /// Every entry for `node_id` now points at `addr`.
    pub fn relocate(&mut self, node_id: NodeID, addr: SocketAddr) {
        let moved = NodeInfo::new(node_id, addr);
        let entries = self
            .predecessor
            .iter_mut()
            .chain(self.successors.iter_mut())
            .chain(self.fingers.iter_mut().flatten());
        for entry in entries {
            if entry.node_id == node_id {
                *entry = moved;
            }
        }
    }

    pub fn set_predecessor(&mut self, node: NodeInfo) {
        if node.node_id == self.me.node_id && !self.is_self_ring() {
            return;
        }
        self.predecessor = Some(node);
    }

    pub fn clear_predecessor(&mut self) {
        self.predecessor = None;
    }

    /// Notify rule: take `candidate` as predecessor iff none is set or it
    /// lies strictly between the current predecessor and us.
    pub fn offer_predecessor(&mut self, candidate: NodeInfo) -> bool {
        if candidate.node_id == self.me.node_id {
            return false;
        }
        let accept = match self.predecessor {
            None => true,
            Some(current) => candidate
                .node_id
                .is_between(&current.node_id, &self.me.node_id),
        };
        if accept {
            self.predecessor = Some(candidate);
        }
        accept
    }

    /// Place `candidate` in the successor list by clockwise distance.
    /// A candidate already present keeps the incumbent entry; the own
    /// identifier is never inserted but is displaced by any other node.
    /// Returns true if the list changed.
    pub fn add_successor(&mut self, candidate: NodeInfo) -> bool {
        if candidate.node_id == self.me.node_id {
            return false;
        }
        if self.is_self_ring() {
            self.successors.clear();
        }
        if self
            .successors
            .iter()
            .any(|s| s.node_id == candidate.node_id)
        {
            return false;
        }
        let me = self.me;
        let pos = self
            .successors
            .iter()
            .position(|s| me.cmp_from(s, &candidate) == Ordering::Greater)
            .unwrap_or(self.successors.len());
        if pos >= self.max_successors {
            return false;
        }
        self.successors.insert(pos, candidate);
        self.successors.truncate(self.max_successors);
        true
    }

    /// Merge a successor list reported by `reporter`.
    ///
    /// When the reporter is our immediate successor its list is
    /// authoritative: ours becomes the reporter followed by its list, which
    /// drops entries it no longer knows. Any other report is merged entry by
    /// entry through [`LocationTable::add_successor`].
    pub fn update_successor_list(&mut self, reporter: NodeInfo, reported: &[NodeInfo]) -> bool {
        let before = self.successors.clone();
        let from_head = self.successor().map(|s| s.node_id) == Some(reporter.node_id);
        if from_head {
            let me = self.me;
            let mut rebuilt: Vec<NodeInfo> = Vec::with_capacity(self.max_successors);
            for node in std::iter::once(&reporter).chain(reported.iter()) {
                if node.node_id == me.node_id || rebuilt.iter().any(|n| n.node_id == node.node_id) {
                    continue;
                }
                rebuilt.push(*node);
            }
            rebuilt.sort_by(|a, b| me.cmp_from(a, b));
            rebuilt.truncate(self.max_successors);
            self.successors = rebuilt;
        } else {
            self.add_successor(reporter);
            for node in reported {
                self.add_successor(*node);
            }
        }
        self.successors != before
    }

    /// Replace the successor list wholesale with `head` as the only entry.
    pub fn reset_successors(&mut self, head: NodeInfo) {
        self.successors.clear();
        if head.node_id == self.me.node_id {
            self.successors.push(self.me);
        } else {
            self.successors.push(head);
        }
    }

    /// One-node ring: we are our own successor and predecessor.
    pub fn make_self_ring(&mut self) {
        self.successors = vec![self.me];
        self.predecessor = Some(self.me);
        self.fingers = vec![None; FINGER_COUNT];
    }

    /// Drop every entry referring to `node_id`. An emptied successor list
    /// is refilled from the closest known finger when possible.
    pub fn remove_peer(&mut self, node_id: NodeID) -> TableStatus {
        if node_id == self.me.node_id {
            return self.status();
        }
        if self.predecessor.map(|p| p.node_id) == Some(node_id) {
            self.predecessor = None;
        }
        self.successors.retain(|s| s.node_id != node_id);
        self.forget_finger(node_id);
        if self.successors.is_empty() {
            if let Some(closest) = self.fingers.iter().flatten().next().copied() {
                self.successors.push(closest);
            }
        }
        self.status()
    }

    /// Drop `node_id` from the finger table only.
    pub fn forget_finger(&mut self, node_id: NodeID) {
        for slot in self.fingers.iter_mut() {
            if slot.map(|f| f.node_id) == Some(node_id) {
                *slot = None;
            }
        }
    }

    /// A successor left the ring and handed over its successor list.
    pub fn successor_left(&mut self, leaving: NodeID, handover: &[NodeInfo]) -> TableStatus {
        let was_head = self.successor().map(|s| s.node_id) == Some(leaving);
        self.remove_peer(leaving);
        if was_head {
            self.successors.retain(|s| s.node_id != leaving);
        }
        for node in handover {
            self.add_successor(*node);
        }
        let handed_back_to_us = handover.iter().any(|n| n.node_id == self.me.node_id);
        if self.successors.is_empty() && handed_back_to_us {
            self.make_self_ring();
        }
        self.status()
    }

    /// Our predecessor left the ring and named its own predecessor.
    pub fn predecessor_left(&mut self, leaving: NodeID, replacement: Option<NodeInfo>) -> TableStatus {
        let was_pred = self.predecessor.map(|p| p.node_id) == Some(leaving);
        self.remove_peer(leaving);
        if !was_pred {
            return self.status();
        }
        match replacement {
            Some(node) if node.node_id == self.me.node_id => {
                if self.successors.is_empty() {
                    self.make_self_ring();
                } else {
                    self.predecessor = Some(self.me);
                }
            }
            Some(node) => self.predecessor = Some(node),
            None => self.predecessor = None,
        }
        self.status()
    }

    /// Offer a peer learned over the wire to every finger slot it may serve:
    /// slot `i` takes it if it lies past `me + 2^i` and is closer to that
    /// start than the current entry.
    pub fn learn(&mut self, node: NodeInfo) {
        if node.node_id == self.me.node_id {
            return;
        }
        let me = self.me.node_id;
        let Some(top) = me.distance(&node.node_id).highest_bit() else {
            return;
        };
        for i in 0..=top {
            let start = me.add_pow2(i);
            let better = match self.fingers[i] {
                None => true,
                Some(current) => start.distance(&node.node_id) < start.distance(&current.node_id),
            };
            if better {
                self.fingers[i] = Some(node);
            }
        }
        self.normalize_fingers();
    }

    /// Result of `find_successor(me + 2^index)`.
    pub fn set_finger(&mut self, index: usize, node: NodeInfo) {
        if index >= FINGER_COUNT {
            tracing::error!(index, "finger index out of range");
            return;
        }
        self.fingers[index] = if node.node_id == self.me.node_id {
            None
        } else {
            Some(node)
        };
        self.normalize_fingers();
    }

    /// Round-robin slot for the next `fix_fingers` call.
    pub fn next_finger_index(&mut self) -> usize {
        let index = self.next_finger;
        self.next_finger = (self.next_finger + 1) % FINGER_COUNT;
        index
    }

    // Keep entries non-decreasing in distance from us: a lower slot may
    // always use a closer entry found in a higher slot.
    fn normalize_fingers(&mut self) {
        let me = self.me;
        let mut closest_above: Option<NodeInfo> = None;
        for slot in self.fingers.iter_mut().rev() {
            if let (Some(current), Some(above)) = (*slot, closest_above) {
                if me.cmp_from(&current, &above) == Ordering::Greater {
                    *slot = Some(above);
                }
            }
            if slot.is_some() {
                closest_above = *slot;
            }
        }
    }

    /// Finger entry closest to, but not past, `target`.
    pub fn best_finger(&self, target: NodeID) -> Option<NodeInfo> {
        self.best_finger_avoiding(target, &HashSet::new())
    }

    fn best_finger_avoiding(&self, target: NodeID, avoid: &HashSet<NodeID>) -> Option<NodeInfo> {
        let me = self.me.node_id;
        self.fingers
            .iter()
            .rev()
            .flatten()
            .find(|f| !avoid.contains(&f.node_id) && f.node_id.is_between(&me, &target))
            .copied()
    }

    /// Best next hop towards `target`: the known node closest to but
    /// preceding it, scanning fingers from farthest to nearest and the
    /// successor list. Returns ourselves when nothing precedes the target.
    pub fn closest_preceding_node(&self, target: NodeID) -> NodeInfo {
        self.closest_preceding_avoiding(target, &HashSet::new())
    }

    /// [`LocationTable::closest_preceding_node`] skipping peers a lookup
    /// already found unresponsive.
    pub fn closest_preceding_avoiding(&self, target: NodeID, avoid: &HashSet<NodeID>) -> NodeInfo {
        let me = self.me;
        let from_successors = self
            .successors
            .iter()
            .filter(|s| !avoid.contains(&s.node_id) && s.node_id.is_between(&me.node_id, &target))
            .max_by(|a, b| me.cmp_from(a, b))
            .copied();
        match (self.best_finger_avoiding(target, avoid), from_successors) {
            (Some(f), Some(s)) => {
                if me.cmp_from(&s, &f) == Ordering::Greater {
                    s
                } else {
                    f
                }
            }
            (Some(f), None) => f,
            (None, Some(s)) => s,
            (None, None) => me,
        }
    }

    /// First successor not in `avoid`.
    pub fn first_successor_avoiding(&self, avoid: &HashSet<NodeID>) -> Option<NodeInfo> {
        self.successors
            .iter()
            .find(|s| !avoid.contains(&s.node_id))
            .copied()
    }

    /// Every distinct peer we know of, closest first.
    pub fn known_peers(&self) -> Vec<NodeInfo> {
        let me = self.me;
        let mut peers: Vec<NodeInfo> = Vec::new();
        let candidates = self
            .successors
            .iter()
            .chain(self.fingers.iter().flatten())
            .chain(self.predecessor.iter());
        for node in candidates {
            if node.node_id != me.node_id && !peers.iter().any(|p| p.node_id == node.node_id) {
                peers.push(*node);
            }
        }
        peers.sort_by(|a, b| me.cmp_from(a, b));
        peers
    }

    /// Forget all routing state, keeping only our own identity.
    pub fn clear(&mut self) {
        self.predecessor = None;
        self.successors.clear();
        self.fingers = vec![None; FINGER_COUNT];
        self.next_finger = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::test_support::{id, make_peer};

    fn table(me: u64, max: usize) -> LocationTable {
        LocationTable::new(make_peer(me), max)
    }

    fn ids(nodes: &[NodeInfo]) -> Vec<NodeID> {
        nodes.iter().map(|n| n.node_id).collect()
    }

    #[test]
    fn successors_stay_closest_first_and_bounded() {
        let mut t = table(10, 3);
        assert_eq!(t.status(), TableStatus::Unstable);
        assert!(t.add_successor(make_peer(90)));
        assert!(t.add_successor(make_peer(40)));
        assert!(t.add_successor(make_peer(5))); // wraps: farthest from 10
        assert_eq!(ids(t.successors()), vec![id(40), id(90), id(5)]);

        // farther than everything in a full list
        assert!(!t.add_successor(make_peer(7)));
        // closer than the head
        assert!(t.add_successor(make_peer(20)));
        assert_eq!(ids(t.successors()), vec![id(20), id(40), id(90)]);
        assert_eq!(t.status(), TableStatus::Stable);
    }

    #[test]
    fn incumbent_wins_ties_and_self_is_rejected() {
        let mut t = table(10, 4);
        let first = make_peer(40);
        t.add_successor(first);
        let mut moved = make_peer(40);
        moved.udp_port = 9999;
        assert!(!t.add_successor(moved));
        assert_eq!(t.successor(), Some(first));

        assert!(!t.add_successor(make_peer(10)));
        assert!(t.successors().iter().all(|s| s.node_id != id(10)));
    }

    #[test]
    fn head_report_rebuilds_list() {
        let mut t = table(10, 3);
        t.add_successor(make_peer(40));
        t.add_successor(make_peer(60));
        t.add_successor(make_peer(70));

        // 40 no longer knows 60 and reports us back in its list
        let changed = t.update_successor_list(make_peer(40), &[make_peer(70), make_peer(90), make_peer(10)]);
        assert!(changed);
        assert_eq!(ids(t.successors()), vec![id(40), id(70), id(90)]);

        // a report from elsewhere only merges
        t.update_successor_list(make_peer(80), &[]);
        assert_eq!(ids(t.successors()), vec![id(40), id(70), id(80)]);
    }

    #[test]
    fn notify_rule_only_accepts_closer_predecessors() {
        let mut t = table(50, 3);
        assert!(t.offer_predecessor(make_peer(10)));
        assert!(t.offer_predecessor(make_peer(30)));
        assert!(!t.offer_predecessor(make_peer(20)));
        assert!(!t.offer_predecessor(make_peer(70)));
        assert!(!t.offer_predecessor(make_peer(50)));
        assert_eq!(t.predecessor().map(|p| p.node_id), Some(id(30)));
        t.clear_predecessor();
        assert!(t.offer_predecessor(make_peer(70)));
    }

    #[test]
    fn self_ring_is_displaced_by_any_peer() {
        let mut t = table(10, 3);
        t.make_self_ring();
        assert!(t.is_self_ring());
        assert_eq!(t.successor().map(|s| s.node_id), Some(id(10)));
        assert_eq!(t.predecessor().map(|s| s.node_id), Some(id(10)));

        assert!(t.offer_predecessor(make_peer(90)));
        assert!(t.add_successor(make_peer(90)));
        assert_eq!(ids(t.successors()), vec![id(90)]);
        assert!(!t.is_self_ring());
    }

    #[test]
    fn removing_last_successor_falls_back_to_fingers() {
        let mut t = table(10, 2);
        t.add_successor(make_peer(40));
        t.learn(make_peer(70));
        t.set_predecessor(make_peer(90));

        assert_eq!(t.remove_peer(id(40)), TableStatus::Stable);
        assert_eq!(t.successor().map(|s| s.node_id), Some(id(70)));
        // the predecessor relationship survives the loss of a successor
        assert_eq!(t.predecessor().map(|p| p.node_id), Some(id(90)));

        assert_eq!(t.remove_peer(id(70)), TableStatus::Unstable);
        assert!(t.successor().is_none());
    }

    #[test]
    fn learned_fingers_point_at_first_node_past_each_start() {
        let mut t = table(0, 3);
        t.learn(make_peer(40));
        // slots 0..=5 start at 1,2,4,...,32: all served by 40
        for i in 0..=5 {
            assert_eq!(t.finger(i).map(|f| f.node_id), Some(id(40)));
        }
        assert!(t.finger(6).is_none());

        t.learn(make_peer(20));
        // 20 is closer for starts 1..16, 40 still serves start 32
        for i in 0..=4 {
            assert_eq!(t.finger(i).map(|f| f.node_id), Some(id(20)));
        }
        assert_eq!(t.finger(5).map(|f| f.node_id), Some(id(40)));
    }

    #[test]
    fn fingers_are_monotonic_after_set() {
        let mut t = table(0, 3);
        t.set_finger(6, make_peer(70));
        // stale far entry in a low slot gets pulled in
        t.set_finger(2, make_peer(100));
        let me = t.me();
        let mut last: Option<NodeInfo> = None;
        for f in t.fingers().iter().flatten() {
            if let Some(prev) = last {
                assert_ne!(me.cmp_from(&prev, f), Ordering::Greater);
            }
            last = Some(*f);
        }
        assert_eq!(t.finger(2).map(|f| f.node_id), Some(id(70)));
        t.set_finger(1, make_peer(0));
        assert!(t.finger(1).is_none());
    }

    #[test]
    fn closest_preceding_scans_far_to_near() {
        let mut t = table(10, 3);
        t.add_successor(make_peer(40));
        t.learn(make_peer(40));
        t.learn(make_peer(70));
        t.learn(make_peer(90));

        assert_eq!(t.best_finger(id(95)).map(|f| f.node_id), Some(id(90)));
        assert_eq!(t.closest_preceding_node(id(80)).node_id, id(70));
        assert_eq!(t.closest_preceding_node(id(50)).node_id, id(40));
        // nothing between 10 and 20
        assert_eq!(t.closest_preceding_node(id(20)).node_id, id(10));

        let avoid: HashSet<NodeID> = [id(70)].into_iter().collect();
        assert_eq!(t.closest_preceding_avoiding(id(80), &avoid).node_id, id(40));
        let avoid: HashSet<NodeID> = [id(40)].into_iter().collect();
        assert!(t.first_successor_avoiding(&avoid).is_none());
    }

    #[test]
    fn leaving_successor_hands_over_its_list() {
        let mut t = table(10, 3);
        t.add_successor(make_peer(40));
        t.add_successor(make_peer(90));
        t.successor_left(id(40), &[make_peer(90), make_peer(10)]);
        assert_eq!(ids(t.successors()), vec![id(90)]);

        // last other member leaves a two-node ring
        let mut t = table(10, 3);
        t.add_successor(make_peer(40));
        t.set_predecessor(make_peer(40));
        t.successor_left(id(40), &[make_peer(10)]);
        assert!(t.is_self_ring());
    }

    #[test]
    fn empty_handover_without_fingers_is_unstable() {
        let mut t = table(10, 3);
        t.add_successor(make_peer(40));
        t.learn(make_peer(40));
        t.set_predecessor(make_peer(40));
        assert_eq!(t.successor_left(id(40), &[]), TableStatus::Unstable);
        assert!(t.successors().is_empty());
        assert!(t.predecessor().is_none());

        // a finger still refills the list
        let mut t = table(10, 3);
        t.add_successor(make_peer(40));
        t.learn(make_peer(70));
        assert_eq!(t.successor_left(id(40), &[]), TableStatus::Stable);
        assert_eq!(ids(t.successors()), vec![id(70)]);

        let mut t = table(90, 3);
        t.set_predecessor(make_peer(40));
        assert_eq!(t.predecessor_left(id(40), None), TableStatus::Unstable);
    }

    #[test]
    fn leaving_predecessor_names_replacement() {
        let mut t = table(90, 3);
        t.add_successor(make_peer(10));
        t.set_predecessor(make_peer(40));
        t.predecessor_left(id(40), Some(make_peer(10)));
        assert_eq!(t.predecessor().map(|p| p.node_id), Some(id(10)));

        // not our predecessor: only forgotten
        t.predecessor_left(id(70), Some(make_peer(20)));
        assert_eq!(t.predecessor().map(|p| p.node_id), Some(id(10)));
    }

    #[test]
    fn known_peers_are_distinct_and_ordered() {
        let mut t = table(10, 3);
        t.add_successor(make_peer(40));
        t.learn(make_peer(40));
        t.learn(make_peer(70));
        t.set_predecessor(make_peer(5));
        assert_eq!(ids(&t.known_peers()), vec![id(40), id(70), id(5)]);
        t.clear();
        assert!(t.known_peers().is_empty());
    }

    #[test]
    fn relocated_peer_is_rewritten_everywhere() {
        let mut t = table(10, 3);
        t.add_successor(make_peer(40));
        t.learn(make_peer(40));
        t.set_predecessor(make_peer(40));
        let moved: std::net::SocketAddr = "127.0.0.1:20040".parse().unwrap();
        t.relocate(id(40), moved);
        assert_eq!(t.successor().map(|s| s.addr()), Some(moved));
        assert_eq!(t.predecessor().map(|p| p.addr()), Some(moved));
        assert!(t.fingers().iter().flatten().all(|f| f.addr() == moved));

        t.rebind("127.0.0.1:20010".parse().unwrap());
        assert_eq!(t.me().addr(), "127.0.0.1:20010".parse().unwrap());
        assert_eq!(t.me().node_id, id(10));
    }
}
