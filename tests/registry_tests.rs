//! Exercises the Transfer Registry's dual-index invariants under randomized
//! add/cancel/remove sequences.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use state_consumer::{InboundTransferTask, NodeId, SegmentId};

use common::FakeRpc;

fn task(source: &str, segs: &[SegmentId]) -> Arc<InboundTransferTask<String, String>> {
    let rpc: Arc<FakeRpc<String, String>> = Arc::new(FakeRpc::default());
    Arc::new(InboundTransferTask::new(
        NodeId::from(source),
        segs.iter().copied().collect(),
        1,
        rpc,
    ))
}

#[test]
fn random_add_cancel_remove_sequence_preserves_invariants() {
    let registry: state_consumer::registry::TransferRegistry<String, String> =
        state_consumer::registry::TransferRegistry::new();

    // Segment 0..8 spread across three rounds of churn.
    let mut expected_segments: HashSet<SegmentId> = HashSet::new();

    for round in 0..3u32 {
        let base = round * 3;
        let segs: HashSet<SegmentId> = (base..base + 3).collect();
        let t = task(&format!("source-{round}"), &segs.iter().copied().collect::<Vec<_>>());
        let added = registry.add_transfer(t.clone(), &segs);
        assert!(added.is_some());
        expected_segments.extend(&segs);

        assert_eq!(registry.by_segment_keys(), expected_segments);
    }

    // Cancel the middle round's segments; the others must be untouched.
    let to_cancel: HashSet<SegmentId> = (3..6).collect();
    let cancelled = registry.cancel_transfers(&to_cancel);
    assert_eq!(cancelled.len(), 1);
    expected_segments.retain(|s| !to_cancel.contains(s));
    assert_eq!(registry.by_segment_keys(), expected_segments);

    // remove_transfer on an already-cancelled task's handle is a no-op.
    let (cancelled_task, _) = &cancelled[0];
    assert!(!registry.remove_transfer(cancelled_task));
}

#[test]
fn add_transfer_never_double_assigns_a_segment() {
    let registry: state_consumer::registry::TransferRegistry<String, String> =
        state_consumer::registry::TransferRegistry::new();

    let t1 = task("a", &[0, 1, 2]);
    registry.add_transfer(t1.clone(), &[0, 1, 2].into_iter().collect());

    let t2 = task("b", &[2, 3]);
    registry.add_transfer(t2.clone(), &[2, 3].into_iter().collect());

    // segment 2 stays with whichever task got it first (t1); the registry
    // never hands the same segment id to two tasks at once.
    assert!(registry.by_segment_keys().contains(&2));
    assert_eq!(registry.by_segment_keys(), [0, 1, 2, 3].into_iter().collect());
}

#[test]
fn restart_broken_transfers_only_touches_missing_sources() {
    let registry: state_consumer::registry::TransferRegistry<String, String> =
        state_consumer::registry::TransferRegistry::new();

    let stays = task("alive", &[0]);
    registry.add_transfer(stays.clone(), &[0].into_iter().collect());
    let leaves = task("gone", &[1, 2]);
    registry.add_transfer(leaves.clone(), &[1, 2].into_iter().collect());

    let valid: HashSet<NodeId> = [NodeId::from("alive")].into_iter().collect();
    let needing_retransfer = registry.restart_broken_transfers(&valid);

    assert_eq!(needing_retransfer, [1, 2].into_iter().collect());
    assert_eq!(registry.by_segment_keys(), [0].into_iter().collect());
    assert_eq!(registry.by_source_keys(), [NodeId::from("alive")].into_iter().collect());
}
