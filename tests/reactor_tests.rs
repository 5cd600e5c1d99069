//! End-to-end scenarios for the Rebalance Coordinator — bootstrap join,
//! user-write-wins, and cancellation by topology change — driven entirely
//! against the in-memory fakes in `common`, never a real cluster.

mod common;

use std::sync::Arc;
use std::time::Duration;

use state_consumer::{
    Collaborators, ConsistentHash, NodeId, RebalanceCoordinator, StateChunk, StateConsumerConfig,
    Topology,
};

use common::{FakeNotifier, FakeRpc, RecordingInterceptors};

fn four_segment_ch(owners: Vec<&str>) -> ConsistentHash {
    ConsistentHash::new(
        owners.len() as u32,
        owners.into_iter().map(|o| vec![NodeId::from(o)]).collect(),
    )
}

fn coordinator_for(
    self_id: &str,
    initial: Topology,
    rpc: Arc<FakeRpc<String, String>>,
    interceptors: Arc<RecordingInterceptors<String, String>>,
    notifier: Arc<FakeNotifier>,
) -> Arc<RebalanceCoordinator<String, String>> {
    RebalanceCoordinator::new(
        NodeId::from(self_id),
        StateConsumerConfig {
            state_transfer_timeout: Duration::from_millis(500),
            ..StateConsumerConfig::default()
        },
        initial,
        Collaborators {
            rpc,
            interceptors,
            persistence: None,
            tx_manager: None,
            tx_table: None,
            total_order: None,
            l1: None,
            notifier: Some(notifier),
        },
    )
}

/// Node A alone owns every segment; node B joins and the
/// write-CH splits segments 1 and 3 onto B. Source selection must consult
/// the *old* CH (A still owns everything there) even though the pending
/// write-CH already lists B as the new owner.
#[tokio::test]
async fn bootstrap_join_pulls_from_prior_owner_and_completes_rebalance() {
    let old_ch = Arc::new(four_segment_ch(vec!["a", "a", "a", "a"]));
    let new_ch = Arc::new(four_segment_ch(vec!["a", "b", "a", "b"]));

    let rpc = Arc::new(FakeRpc::<String, String>::default());
    let interceptors = Arc::new(RecordingInterceptors::<String, String>::default());
    let notifier = Arc::new(FakeNotifier::default());

    let initial = Topology::stable(1, vec![NodeId::from("a")], old_ch.clone());
    let coordinator = coordinator_for("b", initial, rpc.clone(), interceptors.clone(), notifier.clone());

    let rebalancing = Topology::rebalancing(
        2,
        vec![NodeId::from("a"), NodeId::from("b")],
        old_ch.clone(),
        new_ch.clone(),
    );
    coordinator.on_topology_update(rebalancing, true).await.unwrap();

    assert!(coordinator.is_rebalancing());
    // The pump drains the ready-queue on its own spawned task; give it a
    // turn before asserting on what it sent.
    tokio::time::sleep(Duration::from_millis(20)).await;
    // B must have asked A -- the prior owner under the old CH -- to start
    // streaming exactly the segments it is newly responsible for.
    let started = rpc.started.lock().unwrap().clone();
    assert_eq!(started.len(), 1);
    let (source, mut segs) = started[0].clone();
    segs.sort();
    assert_eq!(source, "a");
    assert_eq!(segs, vec![1, 3]);

    let chunks = vec![
        StateChunk {
            segment_id: 1,
            entries: Some(vec![("k1".to_string(), "v1".to_string())]),
            is_last: true,
        },
        StateChunk {
            segment_id: 3,
            entries: Some(vec![("k3".to_string(), "v3".to_string())]),
            is_last: true,
        },
    ];
    coordinator.apply_state(&NodeId::from("a"), 2, chunks).await.unwrap();

    let applied = interceptors.applied.lock().unwrap().clone();
    assert_eq!(
        applied,
        vec![
            ("k1".to_string(), "v1".to_string()),
            ("k3".to_string(), "v3".to_string())
        ]
    );
    assert!(!coordinator.has_active_transfers());

    // The topology manager settles the rebalance with a stable topology
    // (read-CH == write-CH, is_rebalance == false): rebalance_in_progress
    // must flip false exactly once.
    let settled = Topology::stable(2, vec![NodeId::from("a"), NodeId::from("b")], new_ch);
    coordinator.on_topology_update(settled.clone(), false).await.unwrap();
    assert!(!coordinator.is_rebalancing());

    // A duplicate terminal update must not emit a second rehash-end event.
    coordinator.on_topology_update(settled, false).await.unwrap();
    let rehash_end_events = notifier
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, is_pre)| !is_pre)
        .count();
    assert_eq!(rehash_end_events, 1);
}

/// A user write for a key lands after the chunk for that key's segment has
/// been requested but before it arrives. The applier must skip the
/// transferred value.
#[tokio::test]
async fn user_write_wins_over_in_flight_chunk() {
    let old_ch = Arc::new(four_segment_ch(vec!["a", "a", "a", "a"]));
    let new_ch = Arc::new(four_segment_ch(vec!["a", "a", "a", "c"]));

    let rpc = Arc::new(FakeRpc::<String, String>::default());
    let interceptors = Arc::new(RecordingInterceptors::<String, String>::default());
    let notifier = Arc::new(FakeNotifier::default());

    let initial = Topology::stable(1, vec![NodeId::from("a")], old_ch.clone());
    let coordinator = coordinator_for("c", initial, rpc, interceptors.clone(), notifier);

    let rebalancing = Topology::rebalancing(
        2,
        vec![NodeId::from("a"), NodeId::from("c")],
        old_ch,
        new_ch,
    );
    coordinator.on_topology_update(rebalancing, true).await.unwrap();

    // A user write for "x" (segment 3) lands before the transferred chunk.
    coordinator.add_updated_key("x".to_string());

    let chunk = StateChunk {
        segment_id: 3,
        entries: Some(vec![
            ("x".to_string(), "stale-from-state-transfer".to_string()),
            ("y".to_string(), "fresh-from-state-transfer".to_string()),
        ]),
        is_last: true,
    };
    coordinator
        .apply_state(&NodeId::from("a"), 2, vec![chunk])
        .await
        .unwrap();

    let applied = interceptors.applied.lock().unwrap().clone();
    assert_eq!(applied, vec![("y".to_string(), "fresh-from-state-transfer".to_string())]);
}

/// A new topology arrives removing a segment this node was
/// mid-pull on. `cancel_transfers` must fire a cancel RPC and drop the
/// segment from the registry, even though the task may still be tracking
/// other segments.
#[tokio::test]
async fn topology_change_cancels_in_flight_segment() {
    let ch_with_c = Arc::new(four_segment_ch(vec!["a", "a", "c", "c"]));
    let ch_without_c_seg2 = Arc::new(four_segment_ch(vec!["a", "a", "b", "c"]));

    let rpc = Arc::new(FakeRpc::<String, String>::default());
    let interceptors = Arc::new(RecordingInterceptors::<String, String>::default());
    let notifier = Arc::new(FakeNotifier::default());

    // C starts already mid-rebalance, owning segments 2 and 3 under the
    // pending write-CH while A still holds them under the old read-CH.
    let old_ch = Arc::new(four_segment_ch(vec!["a", "a", "a", "a"]));
    let initial = Topology::rebalancing(
        1,
        vec![NodeId::from("a"), NodeId::from("c")],
        old_ch.clone(),
        ch_with_c.clone(),
    );
    let coordinator = coordinator_for("c", initial, rpc.clone(), interceptors, notifier);
    // Drive the constructor's implicit "first topology" bookkeeping so the
    // registry already has live tasks for segments 2 and 3 pulled from "a".
    let reinstalled = Topology::rebalancing(1, vec![NodeId::from("a"), NodeId::from("c")], old_ch, ch_with_c);
    coordinator.on_topology_update(reinstalled, true).await.unwrap();
    assert!(coordinator.has_active_transfers());

    // New topology: C no longer owns segment 2 (B does instead); segment 3
    // stays with C.
    let next = Topology::rebalancing(
        2,
        vec![NodeId::from("a"), NodeId::from("b"), NodeId::from("c")],
        ch_with_c,
        ch_without_c_seg2,
    );
    coordinator.on_topology_update(next, true).await.unwrap();

    let cancelled = rpc.cancelled.lock().unwrap().clone();
    assert!(cancelled.iter().any(|(_, segs)| segs.contains(&2)));
}
