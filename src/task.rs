use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collaborators::RpcManager;
use crate::error::Result;
use crate::types::{NodeId, SegmentId, TopologyId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    New,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::New | TaskStatus::Running)
    }
}

/// A pull from one source for a set of segments.
///
/// Tasks are value objects: equality and hashing are by identity (a random
/// id assigned at construction), not by `(source, segments)`, because two
/// tasks can legitimately target the same source at different times within
/// one rebalance (e.g. after a retry).
pub struct InboundTransferTask<K, V> {
    id: Uuid,
    source: NodeId,
    topology_id: TopologyId,
    remaining: Mutex<HashSet<SegmentId>>,
    status: Mutex<TaskStatus>,
    notify: Notify,
    rpc: Arc<dyn RpcManager<K, V>>,
    chunks_applied: AtomicU64,
}

impl<K, V> InboundTransferTask<K, V> {
    pub fn new(
        source: NodeId,
        segments: HashSet<SegmentId>,
        topology_id: TopologyId,
        rpc: Arc<dyn RpcManager<K, V>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            topology_id,
            remaining: Mutex::new(segments),
            status: Mutex::new(TaskStatus::New),
            notify: Notify::new(),
            rpc,
            chunks_applied: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &NodeId {
        &self.source
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    pub fn rpc(&self) -> Arc<dyn RpcManager<K, V>> {
        self.rpc.clone()
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock().unwrap()
    }

    /// Segments this task is still responsible for (neither fully received
    /// nor cancelled). This is also the set used as the `by_segment` index
    /// keys for as long as the task lives — see `TransferRegistry`.
    pub fn segments(&self) -> HashSet<SegmentId> {
        self.remaining.lock().unwrap().clone()
    }

    fn set_status(&self, status: TaskStatus) {
        *self.status.lock().unwrap() = status;
        self.notify.notify_waiters();
    }

    /// Sends `START_STATE_TRANSFER` to the source. Returns success iff the
    /// source acknowledged and started.
    pub async fn request_segments(&self) -> bool {
        let segments: Vec<SegmentId> = self.segments().into_iter().collect();
        if segments.is_empty() {
            self.set_status(TaskStatus::Completed);
            return true;
        }
        *self.status.lock().unwrap() = TaskStatus::Running;
        match self
            .rpc
            .start_state_transfer(&self.source, self.topology_id, &segments)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(source = %self.source, "source declined to start state transfer");
                self.set_status(TaskStatus::Failed);
                false
            }
            Err(err) => {
                warn!(source = %self.source, error = %err, "request_segments rpc failed");
                self.set_status(TaskStatus::Failed);
                false
            }
        }
    }

    /// A chunk for `segment_id` arrived; if it was the last one for that
    /// segment, the segment is done. When every segment is done the task
    /// completes.
    pub fn on_state_received(&self, segment_id: SegmentId, is_last: bool) {
        if !is_last {
            return;
        }
        let empty = {
            let mut remaining = self.remaining.lock().unwrap();
            remaining.remove(&segment_id);
            remaining.is_empty()
        };
        self.chunks_applied.fetch_add(1, Ordering::Relaxed);
        if empty {
            debug!(source = %self.source, task = %self.id, "transfer task completed");
            self.set_status(TaskStatus::Completed);
        }
    }

    /// Blocks until the task reaches a terminal state or `timeout` elapses.
    /// Returns whether it completed successfully.
    pub async fn await_completion(&self, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.status().is_terminal() {
                return self.status() == TaskStatus::Completed;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(source = %self.source, task = %self.id, "state transfer timed out");
                self.set_status(TaskStatus::Failed);
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    /// Sends a cancel RPC for `subset` and removes those segments from this
    /// task's remaining set. If nothing remains, the task is cancelled.
    pub async fn cancel_segments(&self, subset: &[SegmentId]) -> Result<()> {
        if subset.is_empty() {
            return Ok(());
        }
        let res = self
            .rpc
            .cancel_state_transfer(&self.source, self.topology_id, subset)
            .await;
        let empty = {
            let mut remaining = self.remaining.lock().unwrap();
            for s in subset {
                remaining.remove(s);
            }
            remaining.is_empty()
        };
        if empty {
            self.set_status(TaskStatus::Cancelled);
        }
        res
    }

    /// Local forcible stop used when the source has left the cluster; no RPC
    /// is sent.
    pub fn terminate(&self) {
        self.remaining.lock().unwrap().clear();
        self.set_status(TaskStatus::Cancelled);
    }
}

impl<K, V> PartialEq for InboundTransferTask<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<K, V> Eq for InboundTransferTask<K, V> {}

impl<K, V> std::hash::Hash for InboundTransferTask<K, V> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<K, V> std::fmt::Debug for InboundTransferTask<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundTransferTask")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("topology_id", &self.topology_id)
            .field("status", &self.status())
            .field("remaining", &self.remaining.lock().unwrap())
            .finish()
    }
}
