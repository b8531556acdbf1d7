//! The iterative lookup state machine, kept free of IO so the node task
//! can drive many lookups concurrently over one socket.

use std::collections::BTreeMap;

use super::krpc::{Distance, NodeId, NodeInfo};
use super::routing::K;

/// How many queries a lookup keeps in flight.
pub(crate) const ALPHA: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeState {
    Unqueried,
    InFlight,
    Responded,
    Failed,
}

/// An iterative `find_node`/`get_peers` toward a target id.
///
/// The driver repeatedly calls [`LookupState::next_batch`], sends the
/// returned nodes a query each, and feeds replies back through
/// [`LookupState::on_response`] / [`LookupState::on_failure`]. The lookup
/// converges when the `k` closest nodes in the shortlist have all
/// responded.
pub(crate) struct LookupState {
    target: NodeId,
    /// The shortlist, ordered by distance to the target.
    shortlist: BTreeMap<Distance, (NodeInfo, NodeState)>,
    in_flight: usize,
}

impl LookupState {
    pub fn new(target: NodeId, seeds: impl IntoIterator<Item = NodeInfo>) -> Self {
        let mut lookup = Self {
            target,
            shortlist: BTreeMap::new(),
            in_flight: 0,
        };
        for seed in seeds {
            lookup.insert(seed);
        }
        lookup
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    fn insert(&mut self, node: NodeInfo) {
        let distance = self.target.distance(&node.id);
        self.shortlist
            .entry(distance)
            .or_insert((node, NodeState::Unqueried));
    }

    /// The next nodes to query, keeping at most [`ALPHA`] in flight. The
    /// returned nodes are marked in-flight.
    pub fn next_batch(&mut self) -> Vec<NodeInfo> {
        let capacity = ALPHA.saturating_sub(self.in_flight);
        let mut batch = Vec::with_capacity(capacity);
        for (node, state) in self.shortlist.values_mut() {
            if batch.len() == capacity {
                break;
            }
            if *state == NodeState::Unqueried {
                *state = NodeState::InFlight;
                batch.push(*node);
            }
        }
        self.in_flight += batch.len();
        batch
    }

    /// Merges a node's reply into the shortlist.
    pub fn on_response(&mut self, from: &NodeId, nodes: Vec<NodeInfo>) {
        self.mark(from, NodeState::Responded);
        for node in nodes {
            self.insert(node);
        }
    }

    /// Records a query timeout or error.
    pub fn on_failure(&mut self, from: &NodeId) {
        self.mark(from, NodeState::Failed);
    }

    fn mark(&mut self, id: &NodeId, new_state: NodeState) {
        let distance = self.target.distance(id);
        if let Some((_, state)) = self.shortlist.get_mut(&distance) {
            if *state == NodeState::InFlight {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            *state = new_state;
        }
    }

    /// The lookup is done when the `k` closest live entries have all
    /// responded (failed nodes don't count) and nothing is in flight
    /// or worth querying ahead of them.
    pub fn is_done(&self) -> bool {
        let mut seen = 0;
        for (_, state) in self.shortlist.values() {
            match state {
                NodeState::Failed => continue,
                NodeState::Responded => {
                    seen += 1;
                    if seen == K {
                        return true;
                    }
                }
                // an unqueried or in-flight node among the k closest
                // means there is still progress to make
                NodeState::Unqueried | NodeState::InFlight => return false,
            }
        }
        // shortlist exhausted without k responders; done when idle
        self.in_flight == 0
            && !self
                .shortlist
                .values()
                .any(|(_, s)| *s == NodeState::Unqueried)
    }

    /// The closest responded nodes, for announcing.
    pub fn closest_responded(&self, count: usize) -> Vec<NodeInfo> {
        self.shortlist
            .values()
            .filter(|(_, state)| *state == NodeState::Responded)
            .take(count)
            .map(|(node, _)| *node)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeInfo {
        let mut id = [0u8; 20];
        id[19] = byte;
        NodeInfo {
            id: NodeId(id),
            addr: ([10, 0, 0, byte], 6881).into(),
        }
    }

    #[test]
    fn test_batches_respect_alpha() {
        let target = NodeId([0u8; 20]);
        let seeds: Vec<NodeInfo> = (1..=10).map(node).collect();
        let mut lookup = LookupState::new(target, seeds);

        let batch = lookup.next_batch();
        assert_eq!(batch.len(), ALPHA);
        // nothing more until responses arrive
        assert!(lookup.next_batch().is_empty());

        // the batch is closest-first
        assert_eq!(batch[0].id, node(1).id);
    }

    #[test]
    fn test_responses_extend_the_shortlist() {
        let target = NodeId([0u8; 20]);
        let mut lookup = LookupState::new(target, vec![node(10)]);
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 1);

        // the response brings closer nodes, which are queried next
        lookup.on_response(&node(10).id, vec![node(1), node(2)]);
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, node(1).id);
    }

    #[test]
    fn test_converges_when_k_closest_responded() {
        let target = NodeId([0u8; 20]);
        let seeds: Vec<NodeInfo> = (1..=(K as u8 + 4)).map(node).collect();
        let mut lookup = LookupState::new(target, seeds);

        while !lookup.is_done() {
            let batch = lookup.next_batch();
            if batch.is_empty() {
                break;
            }
            for queried in batch {
                lookup.on_response(&queried.id, vec![]);
            }
        }
        assert!(lookup.is_done());
        assert_eq!(lookup.closest_responded(K).len(), K);
    }

    #[test]
    fn test_failures_dont_block_convergence() {
        let target = NodeId([0u8; 20]);
        let seeds: Vec<NodeInfo> = (1..=6).map(node).collect();
        let mut lookup = LookupState::new(target, seeds);

        loop {
            let batch = lookup.next_batch();
            if batch.is_empty() {
                break;
            }
            for queried in batch {
                // half the swarm is dead
                if queried.id.0[19] % 2 == 0 {
                    lookup.on_failure(&queried.id);
                } else {
                    lookup.on_response(&queried.id, vec![]);
                }
            }
        }
        // fewer than k responders exist, yet the lookup terminates
        assert!(lookup.is_done());
        assert!(lookup.closest_responded(K).len() < K);
    }
}
