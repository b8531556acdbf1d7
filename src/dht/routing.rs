//! The Kademlia routing table: 160 buckets of up to `k` nodes each,
//! ordered by XOR distance from our own id.

use std::time::{Duration, Instant};

use super::krpc::{NodeId, NodeInfo};

/// The bucket capacity.
pub(crate) const K: usize = 8;

/// A node that responded within this window is good.
const GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Query failures after which a node is bad regardless of age.
const MAX_FAILURES: usize = 2;

#[derive(Clone, Debug)]
struct Entry {
    info: NodeInfo,
    /// When the node last answered one of our queries.
    last_response: Option<Instant>,
    /// Consecutive failed queries.
    failures: usize,
}

impl Entry {
    fn is_good(&self) -> bool {
        self.failures < MAX_FAILURES
            && self
                .last_response
                .map(|at| at.elapsed() < GOOD_WINDOW)
                .unwrap_or(false)
    }

    fn is_bad(&self) -> bool {
        self.failures >= MAX_FAILURES
            || self
                .last_response
                .map(|at| at.elapsed() >= GOOD_WINDOW)
                .unwrap_or(true)
    }
}

#[derive(Default)]
struct Bucket {
    entries: Vec<Entry>,
}

/// See the module docs.
pub(crate) struct RoutingTable {
    own_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId) -> Self {
        Self {
            own_id,
            buckets: (0..160).map(|_| Bucket::default()).collect(),
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    fn bucket_of(&self, id: &NodeId) -> Option<usize> {
        self.own_id.distance(id).bucket_index()
    }

    /// Inserts or refreshes a node.
    ///
    /// If its bucket has space or contains a bad node to evict, the node
    /// goes in; otherwise, with a bucket full of good nodes, the newcomer
    /// is dropped.
    pub fn add_node(&mut self, info: NodeInfo, responded: bool) {
        let Some(index) = self.bucket_of(&info.id) else {
            // our own id
            return;
        };
        let now_response = responded.then(Instant::now);
        let bucket = &mut self.buckets[index];

        if let Some(entry) =
            bucket.entries.iter_mut().find(|e| e.info.id == info.id)
        {
            entry.info = info;
            if let Some(at) = now_response {
                entry.last_response = Some(at);
                entry.failures = 0;
            }
            return;
        }

        let entry = Entry {
            info,
            last_response: now_response,
            failures: 0,
        };
        if bucket.entries.len() < K {
            bucket.entries.push(entry);
            return;
        }
        if let Some(pos) = bucket.entries.iter().position(Entry::is_bad) {
            bucket.entries[pos] = entry;
            return;
        }
        // a bucket full of good nodes keeps its elders
        log::trace!("Dropping node {:?}: bucket {index} full", entry.info);
    }

    /// Marks a node as having answered a query.
    pub fn mark_responded(&mut self, id: &NodeId) {
        if let Some(entry) = self.entry_mut(id) {
            entry.last_response = Some(Instant::now());
            entry.failures = 0;
        }
    }

    /// Charges a query failure against a node.
    pub fn mark_failed(&mut self, id: &NodeId) {
        if let Some(entry) = self.entry_mut(id) {
            entry.failures += 1;
        }
    }

    fn entry_mut(&mut self, id: &NodeId) -> Option<&mut Entry> {
        let index = self.bucket_of(id)?;
        self.buckets[index]
            .entries
            .iter_mut()
            .find(|e| e.info.id == *id)
    }

    /// The `count` known nodes closest to the target, good nodes first.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeInfo> {
        let mut nodes: Vec<&Entry> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .collect();
        nodes.sort_by_key(|e| {
            (e.is_bad(), target.distance(&e.info.id))
        });
        nodes.into_iter().take(count).map(|e| e.info).collect()
    }

    /// Total nodes currently in the table.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
