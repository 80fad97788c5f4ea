use std::collections::HashSet;

use crate::core::identifier::{Key, NodeID, NodeInfo};
use crate::error::{Error, Result};

/// Bookkeeping for one iterative successor walk: how many remote hops it
/// took, who was asked, and which peers failed to answer.
#[derive(Debug)]
pub(super) struct Lookup {
    pub(super) key: Key,
    max_hops: usize,
    pub(super) hops: usize,
    pub(super) visited: Vec<NodeID>,
    failed: HashSet<NodeID>,
}

impl Lookup {
    pub(super) fn new(key: Key, max_hops: usize) -> Self {
        Lookup {
            key,
            max_hops,
            hops: 0,
            visited: Vec::new(),
            failed: HashSet::new(),
        }
    }

    /// Account for asking `next`. Fails once the hop budget is spent, which
    /// is how a walk on an inconsistent ring terminates.
    pub(super) fn advance(&mut self, next: &NodeInfo) -> Result<()> {
        if self.hops >= self.max_hops {
            return Err(Error::LookupExhausted {
                key: self.key,
                hops: self.hops,
            });
        }
        self.hops += 1;
        self.visited.push(next.node_id);
        Ok(())
    }

    pub(super) fn mark_failed(&mut self, node: NodeID) {
        self.failed.insert(node);
    }

    /// Peers the rest of the walk must route around.
    pub(super) fn avoid(&self) -> &HashSet<NodeID> {
        &self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_support::{id, make_peer};

    #[test]
    fn hop_budget_is_enforced() {
        let mut lookup = Lookup::new(id(95), 2);
        lookup.advance(&make_peer(40)).unwrap();
        lookup.advance(&make_peer(90)).unwrap();
        match lookup.advance(&make_peer(10)) {
            Err(Error::LookupExhausted { key, hops }) => {
                assert_eq!(key, id(95));
                assert_eq!(hops, 2);
            }
            other => panic!("expected LookupExhausted, got {:?}", other),
        }
        assert_eq!(lookup.visited, vec![id(40), id(90)]);
    }

    #[test]
    fn failed_peers_are_avoided() {
        let mut lookup = Lookup::new(id(95), 8);
        lookup.mark_failed(id(40));
        lookup.mark_failed(id(40));
        assert_eq!(lookup.avoid().len(), 1);
        assert!(lookup.avoid().contains(&id(40)));
    }
}
