use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::types::{NodeId, SegmentId, TopologyId};

/// Deterministic mapping from segment to an ordered list of owner nodes.
///
/// The owner list for a segment is ordered oldest-owner-first: the entry at
/// index 0 has owned the segment the longest, and the last entry is the most
/// recently assigned owner. The Source Selector relies on this ordering to
/// prefer the newest owner when picking a transfer source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistentHash {
    segment_count: u32,
    owners: Vec<Vec<NodeId>>,
}

impl ConsistentHash {
    /// Builds a CH from an explicit owners-per-segment table. `owners[s]` is
    /// the ordered owner list for segment `s`; every table must be exactly
    /// `segment_count` long.
    pub fn new(segment_count: u32, owners: Vec<Vec<NodeId>>) -> Self {
        assert_eq!(
            owners.len(),
            segment_count as usize,
            "owners table must have one entry per segment"
        );
        Self {
            segment_count,
            owners,
        }
    }

    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }

    /// Ordered owner list for a segment, oldest owner first.
    pub fn owners(&self, segment: SegmentId) -> &[NodeId] {
        &self.owners[segment as usize]
    }

    /// All segments owned (anywhere in the owner list) by `member`.
    pub fn segments_of(&self, member: &NodeId) -> Vec<SegmentId> {
        (0..self.segment_count)
            .filter(|&s| self.owners(s).contains(member))
            .collect()
    }

    /// The deterministic segment a key hashes into.
    pub fn segment_of<K: Hash>(&self, key: &K) -> SegmentId {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.segment_count as u64) as SegmentId
    }

    /// Whether `member` owns the segment that `key` hashes into.
    pub fn is_local<K: Hash>(&self, member: &NodeId, key: &K) -> bool {
        self.owners(self.segment_of(key)).contains(member)
    }

    pub fn owns_segment(&self, member: &NodeId, segment: SegmentId) -> bool {
        self.owners(segment).contains(member)
    }
}

/// Immutable membership + ownership snapshot, replaced atomically on update.
///
/// `write_ch` equals `read_ch` outside of a rebalance; during a rebalance it
/// is the *pending* CH, so that new owners already accept writes while their
/// data is still being populated by the state consumer.
#[derive(Debug, Clone)]
pub struct Topology {
    pub id: TopologyId,
    pub members: Vec<NodeId>,
    pub read_ch: Arc<ConsistentHash>,
    pub write_ch: Arc<ConsistentHash>,
}

impl Topology {
    pub fn stable(id: TopologyId, members: Vec<NodeId>, ch: Arc<ConsistentHash>) -> Self {
        Self {
            id,
            members,
            read_ch: ch.clone(),
            write_ch: ch,
        }
    }

    pub fn rebalancing(
        id: TopologyId,
        members: Vec<NodeId>,
        read_ch: Arc<ConsistentHash>,
        write_ch: Arc<ConsistentHash>,
    ) -> Self {
        Self {
            id,
            members,
            read_ch,
            write_ch,
        }
    }

    /// A rebalance is in flight iff the pending (write) CH differs from the
    /// current (read) CH.
    pub fn has_pending_ch(&self) -> bool {
        self.read_ch != self.write_ch
    }

    pub fn is_member(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }
}
