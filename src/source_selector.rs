//! Picks a remote owner to pull a segment from.

use std::collections::HashMap;
use std::hash::Hash;

use crate::topology::ConsistentHash;
use crate::types::{NodeId, SegmentId};

/// Picks one source for `segment`: the newest owner in `write_ch` (the tail
/// of the owner list, per `ConsistentHash`'s ordering convention) that is
/// neither `self_id` nor in `exclude`. Returns `None` if no such owner
/// exists, which happens when `self_id` is the sole owner or every other
/// owner has already failed for this segment in this rebalance.
pub fn find_source(
    write_ch: &ConsistentHash,
    segment: SegmentId,
    self_id: &NodeId,
    exclude: &[NodeId],
) -> Option<NodeId> {
    write_ch
        .owners(segment)
        .iter()
        .rev()
        .find(|owner| *owner != self_id && !exclude.contains(owner))
        .cloned()
}

/// Groups every segment in `segments` by the source `find_source` picks for
/// it, skipping segments for which no source is available. Used by the
/// Rebalance Coordinator to turn "segments I now own" into one
/// `START_STATE_TRANSFER` batch per source.
pub fn group_by_source(
    write_ch: &ConsistentHash,
    segments: &[SegmentId],
    self_id: &NodeId,
    exclude: &[NodeId],
) -> HashMap<NodeId, Vec<SegmentId>> {
    let mut grouped: HashMap<NodeId, Vec<SegmentId>> = HashMap::new();
    for &segment in segments {
        if let Some(source) = find_source(write_ch, segment, self_id, exclude) {
            grouped.entry(source).or_default().push(segment);
        }
    }
    grouped
}

/// Hash-partitions a flat key collection by segment under `write_ch`. Used
/// by the Segment Invalidator to decide, for each key found in local
/// storage, whether it still belongs here.
pub fn segments_for_keys<K: Hash>(
    write_ch: &ConsistentHash,
    keys: impl IntoIterator<Item = K>,
) -> HashMap<SegmentId, Vec<K>> {
    let mut by_segment: HashMap<SegmentId, Vec<K>> = HashMap::new();
    for key in keys {
        by_segment
            .entry(write_ch.segment_of(&key))
            .or_default()
            .push(key);
    }
    by_segment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(owners: Vec<Vec<&str>>) -> ConsistentHash {
        let segment_count = owners.len() as u32;
        ConsistentHash::new(
            segment_count,
            owners
                .into_iter()
                .map(|row| row.into_iter().map(NodeId::from).collect())
                .collect(),
        )
    }

    #[test]
    fn prefers_newest_owner() {
        let ch = ch(vec![vec!["a", "b", "c"]]);
        let self_id = NodeId::from("d");
        let source = find_source(&ch, 0, &self_id, &[]);
        assert_eq!(source, Some(NodeId::from("c")));
    }

    #[test]
    fn skips_self_and_excluded() {
        let ch = ch(vec![vec!["a", "b", "c"]]);
        let self_id = NodeId::from("c");
        let source = find_source(&ch, 0, &self_id, &[NodeId::from("b")]);
        assert_eq!(source, Some(NodeId::from("a")));
    }

    #[test]
    fn none_when_exhausted() {
        let ch = ch(vec![vec!["a", "b"]]);
        let self_id = NodeId::from("a");
        let source = find_source(&ch, 0, &self_id, &[NodeId::from("b")]);
        assert_eq!(source, None);
    }

    #[test]
    fn group_by_source_buckets_segments() {
        let ch = ch(vec![vec!["a", "b"], vec!["a", "c"]]);
        let self_id = NodeId::from("z");
        let grouped = group_by_source(&ch, &[0, 1], &self_id, &[]);
        assert_eq!(grouped.get(&NodeId::from("b")), Some(&vec![0]));
        assert_eq!(grouped.get(&NodeId::from("c")), Some(&vec![1]));
    }
}
