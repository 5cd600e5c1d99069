//! Drains the transfer registry's ready-queue, one task at a time, retrying
//! failures against a different source.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::TransferRegistry;
use crate::source_selector::group_by_source;
use crate::task::InboundTransferTask;
use crate::topology::ConsistentHash;
use crate::types::{NodeId, TopologyId};

/// Callback invoked whenever a task reaches a terminal state, successfully
/// or not, so the owner (the Rebalance Coordinator) can decide whether the
/// rebalance as a whole is now complete.
pub type OnTaskDone<K, V> = Arc<dyn Fn(Arc<InboundTransferTask<K, V>>) + Send + Sync>;

/// Everything the drain loop needs that changes from one rebalance to the
/// next. Held behind a lock and refreshed on every `start()` call, rather
/// than captured once when the background task is spawned, so a rebalance
/// that arrives while the pump is still draining the previous one's queue
/// is never serviced with a stale `topology_id`/`read_ch`.
struct PumpContext<K, V> {
    timeout: std::time::Duration,
    topology_id: TopologyId,
    read_ch: Arc<ConsistentHash>,
    self_id: NodeId,
    excluded_sources: HashSet<NodeId>,
    on_task_done: OnTaskDone<K, V>,
}

/// Supervises exactly one drain loop over a [`TransferRegistry`]'s
/// ready-queue. A dedicated background thread could CAS-guard its own
/// re-spawn whenever the queue goes empty and then gets new work; the same
/// observable behavior — one worker, drains to empty, stops cleanly, retries
/// failures — falls out naturally from a single `tokio` task parked on
/// `tokio::sync::Notify` between batches, so that is what this uses instead.
pub struct TransferPump<K, V> {
    registry: Arc<TransferRegistry<K, V>>,
    running: AtomicBool,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    context: std::sync::Mutex<Option<PumpContext<K, V>>>,
}

impl<K, V> TransferPump<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(registry: Arc<TransferRegistry<K, V>>) -> Self {
        Self {
            registry,
            running: AtomicBool::new(false),
            handle: std::sync::Mutex::new(None),
            context: std::sync::Mutex::new(None),
        }
    }

    /// Installs the parameters for the rebalance currently in progress and
    /// starts the drain loop if it is not already running.
    ///
    /// Unlike an outright no-op on a second call, this always refreshes the
    /// shared context: a loop already draining the previous rebalance's
    /// queue picks up the new `topology_id`/`read_ch` on its very next
    /// iteration instead of running to completion under stale ones.
    /// `excluded_sources` carries over only when `topology_id` is unchanged
    /// from the previous call (more segments added to the same rebalance);
    /// a new `topology_id` resets it, since a source excluded during a past
    /// rebalance may be healthy again now.
    pub fn start(
        self: &Arc<Self>,
        timeout: std::time::Duration,
        topology_id: TopologyId,
        read_ch: Arc<ConsistentHash>,
        self_id: NodeId,
        on_task_done: OnTaskDone<K, V>,
    ) {
        {
            let mut ctx = self.context.lock().unwrap();
            let excluded_sources = match ctx.as_ref() {
                Some(prev) if prev.topology_id == topology_id => prev.excluded_sources.clone(),
                _ => HashSet::new(),
            };
            *ctx = Some(PumpContext {
                timeout,
                topology_id,
                read_ch,
                self_id,
                excluded_sources,
                on_task_done,
            });
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(topology_id, "transfer pump already running, refreshed rebalance context");
            return;
        }
        let this = self.clone();
        let task = tokio::spawn(async move {
            this.run().await;
            this.running.store(false, Ordering::SeqCst);
        });
        *self.handle.lock().unwrap() = Some(task);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the pump and waits for the in-flight drain iteration, if any,
    /// to observe the stop and return.
    pub async fn stop(&self) {
        self.registry.stop();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.running.store(false, Ordering::SeqCst);
        *self.context.lock().unwrap() = None;
    }

    async fn run(&self) {
        loop {
            let task = match self.registry.pop_ready() {
                Some(task) => task,
                None => {
                    self.registry.work_available.notified().await;
                    continue;
                }
            };

            let (timeout, on_task_done) = {
                let ctx = self.context.lock().unwrap();
                let ctx = ctx
                    .as_ref()
                    .expect("pump running implies a context was installed by start()");
                (ctx.timeout, ctx.on_task_done.clone())
            };

            let started = task.request_segments().await;
            let ok = started && task.await_completion(timeout).await;

            if ok {
                self.registry.remove_transfer(&task);
                on_task_done(task);
                continue;
            }

            self.retry_transfer_task(task);
        }
    }

    /// Removes the failed task, excludes its source from further
    /// consideration this rebalance, recomputes sources for whatever segments
    /// it had not yet received, and re-enqueues one new task per alternate
    /// source found.
    fn retry_transfer_task(&self, task: Arc<InboundTransferTask<K, V>>) {
        let removed = self.registry.remove_transfer(&task);
        if !removed {
            return;
        }

        let (topology_id, read_ch, self_id, excluded, on_task_done) = {
            let mut ctx = self.context.lock().unwrap();
            let ctx = ctx
                .as_mut()
                .expect("pump running implies a context was installed by start()");
            ctx.excluded_sources.insert(task.source().clone());
            let excluded: Vec<NodeId> = ctx.excluded_sources.iter().cloned().collect();
            (
                ctx.topology_id,
                ctx.read_ch.clone(),
                ctx.self_id.clone(),
                excluded,
                ctx.on_task_done.clone(),
            )
        };

        let failed_segments: Vec<_> = task.segments().into_iter().collect();
        if failed_segments.is_empty() {
            on_task_done(task);
            return;
        }

        let regrouped = group_by_source(&read_ch, &failed_segments, &self_id, &excluded);
        if regrouped.is_empty() {
            warn!(
                task = %task.id(),
                segments = ?failed_segments,
                "no alternate source available, segments left unassigned this rebalance"
            );
            on_task_done(task);
            return;
        }

        let rpc = task.rpc();
        for (source, segments) in regrouped {
            let segment_set: HashSet<_> = segments.iter().copied().collect();
            let retry = Arc::new(InboundTransferTask::new(
                source,
                segment_set.clone(),
                topology_id,
                rpc.clone(),
            ));
            self.registry.add_transfer(retry, &segment_set);
        }
        on_task_done(task);
    }
}

impl<K, V> Drop for TransferPump<K, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}
