use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::task::InboundTransferTask;
use crate::types::{NodeId, SegmentId, TopologyId};

type Task<K, V> = Arc<InboundTransferTask<K, V>>;

struct RegistryInner<K, V> {
    by_source: HashMap<NodeId, Vec<Task<K, V>>>,
    by_segment: HashMap<SegmentId, Task<K, V>>,
    ready_queue: VecDeque<Task<K, V>>,
}

impl<K, V> Default for RegistryInner<K, V> {
    fn default() -> Self {
        Self {
            by_source: HashMap::new(),
            by_segment: HashMap::new(),
            ready_queue: VecDeque::new(),
        }
    }
}

/// Dual index (by source, by segment) plus a FIFO ready-queue, all mutated
/// under one lock so the two indexes and the queue never drift apart, and so
/// a segment is never handed to more than one task at a time.
///
/// The lock here is a plain synchronous `std::sync::Mutex`: every critical
/// section is pure bookkeeping (insert/remove from a couple of maps), never
/// an RPC or a command invocation, so there is never an `.await` while the
/// guard is held — a `tokio::sync::Mutex` would only add overhead here.
pub struct TransferRegistry<K, V> {
    inner: Mutex<RegistryInner<K, V>>,
    /// Woken whenever a task is pushed to the ready-queue, so the Transfer
    /// Pump can block without polling.
    pub(crate) work_available: Notify,
}

impl<K, V> Default for TransferRegistry<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            work_available: Notify::new(),
        }
    }
}

impl<K, V> TransferRegistry<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a task for `segs` not already covered by another task and
    /// registers it in both indexes and the ready-queue. Returns `None`
    /// if every segment in `segs` was already assigned.
    pub fn add_transfer(
        &self,
        task: Task<K, V>,
        segs: &HashSet<SegmentId>,
    ) -> Option<Task<K, V>> {
        let mut inner = self.inner.lock().unwrap();
        let fresh: HashSet<SegmentId> = segs
            .iter()
            .copied()
            .filter(|s| !inner.by_segment.contains_key(s))
            .collect();
        if fresh.is_empty() {
            debug!("all requested segments already have an in-flight task");
            return None;
        }
        for &s in &fresh {
            inner.by_segment.insert(s, task.clone());
        }
        inner
            .by_source
            .entry(task.source().clone())
            .or_default()
            .push(task.clone());
        inner.ready_queue.push_back(task.clone());
        self.work_available.notify_one();
        Some(task)
    }

    /// For each segment in `removed`, tells its task to drop just that
    /// segment; a task whose segment set becomes empty is removed entirely.
    pub fn cancel_transfers(
        &self,
        removed: &HashSet<SegmentId>,
    ) -> Vec<(Task<K, V>, Vec<SegmentId>)> {
        let mut inner = self.inner.lock().unwrap();
        let mut to_cancel: HashMap<Uuid, (Task<K, V>, Vec<SegmentId>)> = HashMap::new();

        for &segment in removed {
            let Some(task) = inner.by_segment.get(&segment).cloned() else {
                continue;
            };
            let task_segments = task.segments();
            let intersection: Vec<SegmentId> = task_segments
                .intersection(removed)
                .copied()
                .collect();

            inner.by_segment.remove(&segment);
            to_cancel
                .entry(task.id())
                .or_insert_with(|| (task.clone(), Vec::new()))
                .1
                .extend(intersection.iter().copied().filter(|s| *s == segment));
        }

        // Remove any task whose full segment set is now a subset of `removed`
        // from by_source / ready_queue too (segment-by-segment removal above
        // only touched by_segment).
        for (task, _) in to_cancel.values() {
            if task
                .segments()
                .iter()
                .all(|s| removed.contains(s) || !inner.by_segment.contains_key(s))
                && task.segments().iter().all(|s| !inner.by_segment.contains_key(s))
            {
                remove_task_from_source_and_queue(&mut inner, task);
            }
        }

        to_cancel.into_values().collect()
    }

    /// Removes a task entirely from all three structures. Returns whether
    /// removal actually happened (the task might already be gone).
    pub fn remove_transfer(&self, task: &Task<K, V>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        remove_task_from_source_and_queue(&mut inner, task);
        let had_segments = !task.segments().is_empty()
            || inner.by_segment.values().any(|t| t.id() == task.id());
        inner.by_segment.retain(|_, t| t.id() != task.id());
        had_segments
    }

    pub fn pop_ready(&self) -> Option<Task<K, V>> {
        self.inner.lock().unwrap().ready_queue.pop_front()
    }

    /// Looks up the task currently responsible for `segment`, if any.
    pub fn task_for_segment(&self, segment: SegmentId) -> Option<Task<K, V>> {
        self.inner.lock().unwrap().by_segment.get(&segment).cloned()
    }

    pub fn has_active_transfers(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.by_source.is_empty() || !inner.by_segment.is_empty() || !inner.ready_queue.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_active_transfers()
    }

    /// Sources no longer present in the new topology cannot deliver.
    /// Terminates every task of such a source, removes it from the registry,
    /// and returns the set of segments that still need a home (minus any
    /// segment another source is already delivering).
    pub fn restart_broken_transfers(&self, valid_members: &HashSet<NodeId>) -> HashSet<SegmentId> {
        let mut inner = self.inner.lock().unwrap();
        let broken_sources: Vec<NodeId> = inner
            .by_source
            .keys()
            .filter(|s| !valid_members.contains(*s))
            .cloned()
            .collect();

        let mut needs_retransfer = HashSet::new();
        for source in broken_sources {
            if let Some(tasks) = inner.by_source.remove(&source) {
                for task in tasks {
                    let unfinished = task.segments();
                    task.terminate();
                    info!(source = %source, segments = ?unfinished, "terminated transfer from source that left the cluster");
                    inner.ready_queue.retain(|t| t.id() != task.id());
                    inner.by_segment.retain(|_, t| t.id() != task.id());
                    needs_retransfer.extend(unfinished);
                }
            }
        }

        needs_retransfer.retain(|s| !inner.by_segment.contains_key(s));
        needs_retransfer
    }

    /// Clears the ready-queue, cancels every task locally, and empties both
    /// indexes.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        for task in inner.by_segment.values() {
            task.terminate();
        }
        inner.ready_queue.clear();
        inner.by_source.clear();
        inner.by_segment.clear();
    }

    /// Segment ids currently assigned to some task. Exposed for test
    /// introspection and for callers that want a cheap "what's in flight"
    /// snapshot without holding the lock themselves.
    pub fn by_segment_keys(&self) -> HashSet<SegmentId> {
        self.inner.lock().unwrap().by_segment.keys().copied().collect()
    }

    pub fn by_source_keys(&self) -> HashSet<NodeId> {
        self.inner.lock().unwrap().by_source.keys().cloned().collect()
    }

    pub fn ready_len(&self) -> usize {
        self.inner.lock().unwrap().ready_queue.len()
    }
}

fn remove_task_from_source_and_queue<K, V>(inner: &mut RegistryInner<K, V>, task: &Task<K, V>) {
    inner.ready_queue.retain(|t| t.id() != task.id());
    if let Some(list) = inner.by_source.get_mut(task.source()) {
        list.retain(|t| t.id() != task.id());
        if list.is_empty() {
            inner.by_source.remove(task.source());
        }
    }
}
