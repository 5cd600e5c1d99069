//! Orchestrates a topology change from arrival to `rebalance_complete`.
//! This is the crate's single coordinator type, the way the
//! rest of this codebase has one coordinator per asynchronous subsystem:
//! rebalance is either in progress or not, queried with [`is_rebalancing`].

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock as AsyncRwLock;
use tracing::{info, warn};

use crate::applier::StateApplier;
use crate::collaborators::{
    InterceptorChain, L1Manager, Notifier, PersistenceManager, RpcManager, StateChunk,
    TotalOrderManager, TransactionManager, TransactionTable,
};
use crate::config::StateConsumerConfig;
use crate::error::{Result, StateConsumerError};
use crate::invalidator::SegmentInvalidator;
use crate::pump::TransferPump;
use crate::registry::TransferRegistry;
use crate::source_selector::group_by_source;
use crate::task::InboundTransferTask;
use crate::topology::Topology;
use crate::transaction_fetcher::TransactionFetcher;
use crate::types::{NodeId, SegmentId, TopologyId};
use crate::updated_keys::UpdatedKeysHolder;

/// Everything the coordinator needs from the rest of the cache. Grouped into
/// one struct so construction reads as a single dependency-injection call,
/// the way this codebase wires its other coordinator types.
pub struct Collaborators<K, V> {
    pub rpc: Arc<dyn RpcManager<K, V>>,
    pub interceptors: Arc<dyn InterceptorChain<K, V>>,
    pub persistence: Option<Arc<dyn PersistenceManager<K>>>,
    pub tx_manager: Option<Arc<dyn TransactionManager>>,
    pub tx_table: Option<Arc<dyn TransactionTable<K, V>>>,
    pub total_order: Option<Arc<dyn TotalOrderManager>>,
    pub l1: Option<Arc<dyn L1Manager<K>>>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

pub struct RebalanceCoordinator<K, V> {
    self_id: NodeId,
    config: StateConsumerConfig,
    topology: AsyncRwLock<Arc<Topology>>,
    registry: Arc<TransferRegistry<K, V>>,
    pump: Arc<TransferPump<K, V>>,
    updated_keys: Arc<UpdatedKeysHolder<K>>,
    rebalance_in_progress: AtomicBool,
    waiting_for_state: AtomicBool,
    owns_data: AtomicBool,
    seen_first_update: AtomicBool,
    rpc: Arc<dyn RpcManager<K, V>>,
    applier: StateApplier<K, V>,
    invalidator: SegmentInvalidator<K, V>,
    fetcher: Option<TransactionFetcher<K, V>>,
    tx_table: Option<Arc<dyn TransactionTable<K, V>>>,
    total_order: Option<Arc<dyn TotalOrderManager>>,
    notifier: Option<Arc<dyn Notifier>>,
    persistence: Option<Arc<dyn PersistenceManager<K>>>,
}

impl<K, V> RebalanceCoordinator<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        self_id: NodeId,
        config: StateConsumerConfig,
        initial_topology: Topology,
        collaborators: Collaborators<K, V>,
    ) -> Arc<Self> {
        let registry = Arc::new(TransferRegistry::new());
        let updated_keys = Arc::new(UpdatedKeysHolder::new());
        let applier = StateApplier::new(
            collaborators.interceptors.clone(),
            updated_keys.clone(),
            collaborators.tx_manager.clone(),
            config.mode,
        );
        let invalidator = SegmentInvalidator::new(
            collaborators.interceptors.clone(),
            collaborators.persistence.clone(),
            collaborators.l1.clone(),
        );
        let fetcher = collaborators
            .tx_table
            .clone()
            .map(|table| TransactionFetcher::new(collaborators.rpc.clone(), table));
        let owns_data = initial_topology.members.len() == 1
            && initial_topology.members[0] == self_id;

        Arc::new(Self {
            self_id,
            config,
            topology: AsyncRwLock::new(Arc::new(initial_topology)),
            registry: registry.clone(),
            pump: Arc::new(TransferPump::new(registry)),
            updated_keys,
            rebalance_in_progress: AtomicBool::new(false),
            waiting_for_state: AtomicBool::new(false),
            owns_data: AtomicBool::new(owns_data),
            seen_first_update: AtomicBool::new(false),
            rpc: collaborators.rpc,
            applier,
            invalidator,
            fetcher,
            tx_table: collaborators.tx_table,
            total_order: collaborators.total_order,
            notifier: collaborators.notifier,
            persistence: collaborators.persistence,
        })
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalance_in_progress.load(Ordering::SeqCst)
    }

    pub fn owns_data(&self) -> bool {
        self.owns_data.load(Ordering::SeqCst)
    }

    pub fn has_active_transfers(&self) -> bool {
        self.registry.has_active_transfers()
    }

    pub fn is_state_transfer_in_progress(&self) -> bool {
        self.is_rebalancing() && self.has_active_transfers()
    }

    pub fn is_state_transfer_in_progress_for_key(&self, key: &K) -> bool {
        self.is_state_transfer_in_progress() && self.updated_keys.is_active() && {
            // A key is "in flight" until a user write or applied chunk has
            // settled it; `is_key_updated` already encodes exactly that.
            !self.updated_keys.is_key_updated(key)
        }
    }

    pub async fn get_cache_topology(self: &Arc<Self>) -> Arc<Topology> {
        self.topology.read().await.clone()
    }

    pub fn add_updated_key(&self, key: K) {
        self.updated_keys.add_updated_key(key);
    }

    pub fn is_key_updated(&self, key: &K) -> bool {
        self.updated_keys.is_key_updated(key)
    }

    pub fn execute_if_key_is_not_updated(&self, key: &K, callback: impl FnOnce()) {
        self.updated_keys.execute_if_key_is_not_updated(key, callback)
    }

    /// Final step of a rebalance: stop tracking user writes once every chunk
    /// from it has been applied.
    pub fn stop_applying_state(&self) {
        self.updated_keys.clear();
    }

    pub async fn stop(&self) {
        self.pump.stop().await;
    }

    /// Entry point for every topology push from the Topology Manager, in
    /// topology-id order.
    pub async fn on_topology_update(self: &Arc<Self>, topology: Topology, is_rebalance: bool) -> Result<()> {
        let topology_id = topology.id;
        {
            let current = self.topology.read().await;
            if topology_id < current.id {
                return Err(StateConsumerError::StaleTopology {
                    received: topology_id,
                    current: current.id,
                });
            }
        }

        let is_member = topology.is_member(&self.self_id);
        self.owns_data
            .store(is_member && topology.members.len() == 1, Ordering::SeqCst);

        if is_rebalance {
            self.rebalance_in_progress.store(true, Ordering::SeqCst);
            if let Some(notifier) = &self.notifier {
                notifier.notify_data_rehashed(topology_id, true);
            }
            if self.config.mode.is_total_order() {
                if let Some(total_order) = &self.total_order {
                    let latches = total_order.notify_state_transfer_start(topology_id).await?;
                    for latch in latches {
                        latch.await_drained().await.map_err(|_| StateConsumerError::Interrupted)?;
                    }
                }
            }
        }

        self.waiting_for_state.store(false, Ordering::SeqCst);

        let (old_write_ch, new_write_ch, new_read_ch) = {
            let mut guard = self.topology.write().await;
            let old_write_ch = guard.write_ch.clone();
            if is_rebalance {
                self.updated_keys.install_fresh();
            }
            *guard = Arc::new(topology);
            (old_write_ch, guard.write_ch.clone(), guard.read_ch.clone())
        };

        info!(topology_id, "installed new topology");

        let is_first_update = !self.seen_first_update.swap(true, Ordering::SeqCst);

        if self.config.mode.is_transactional() || self.config.fetch_enabled() {
            let new_owned: HashSet<SegmentId> = new_write_ch.segments_of(&self.self_id).into_iter().collect();

            if is_first_update {
                // No previous write-CH to diff against: everything this
                // node owns now is newly owned.
                let added: Vec<SegmentId> = new_owned.into_iter().collect();
                if is_member {
                    if let Err(err) = self.rpc.request_cache_listeners(&self.self_id).await {
                        warn!(error = %err, "best-effort cluster-listener retrieval failed");
                    }
                }
                if !added.is_empty() {
                    self.add_transfers(topology_id, &new_read_ch, added).await?;
                }
            } else {
                let old_owned: HashSet<SegmentId> = old_write_ch.segments_of(&self.self_id).into_iter().collect();
                let added: Vec<SegmentId> = new_owned.difference(&old_owned).copied().collect();
                let removed: HashSet<SegmentId> = old_owned.difference(&new_owned).copied().collect();

                if !removed.is_empty() {
                    let cancelled = self.registry.cancel_transfers(&removed);
                    for (task, subset) in cancelled {
                        let _ = task.cancel_segments(&subset).await;
                    }
                    if is_member {
                        self.run_invalidation(&new_write_ch, &new_read_ch).await;
                    }
                }

                // A source only counts as "gone" if it left the *read*-CH's
                // membership — that is the ownership view a consumer pulls
                // against, independent of where the pending rebalance is
                // sending writes.
                let valid_members = self.members_from_read_ch(&new_read_ch);
                let mut retransfer = self.registry.restart_broken_transfers(&valid_members);
                retransfer.extend(added);

                if !retransfer.is_empty() {
                    let to_add: Vec<SegmentId> = retransfer.into_iter().collect();
                    self.add_transfers(topology_id, &new_read_ch, to_add).await?;
                }
            }
        }

        let has_pending_ch = self.topology.read().await.has_pending_ch();
        if self.is_rebalancing() && !has_pending_ch && !is_rebalance {
            if self
                .rebalance_in_progress
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if let Some(notifier) = &self.notifier {
                    notifier.notify_data_rehashed(topology_id, false);
                }
                if self.config.mode.is_total_order() {
                    if let Some(total_order) = &self.total_order {
                        total_order.notify_state_transfer_end().await;
                    }
                }
            }
        }

        if self.is_rebalancing() {
            self.waiting_for_state.store(true, Ordering::SeqCst);
        }
        self.notify_end_of_rebalance_if_needed(topology_id).await;

        if let Some(tx_table) = &self.tx_table {
            let members = self.topology.read().await.members.clone();
            tx_table.cleanup_stale_transactions(&members).await?;
        }

        Ok(())
    }

    fn members_from_read_ch(&self, read_ch: &crate::topology::ConsistentHash) -> HashSet<NodeId> {
        (0..read_ch.segment_count())
            .flat_map(|s| read_ch.owners(s).iter().cloned())
            .collect()
    }

    async fn run_invalidation(
        &self,
        write_ch: &crate::topology::ConsistentHash,
        prev_read_ch: &crate::topology::ConsistentHash,
    ) {
        let local_keys = match &self.persistence {
            Some(p) => p.all_keys().await.unwrap_or_default(),
            None => Vec::new(),
        };
        if let Err(err) = self
            .invalidator
            .invalidate_segments(
                write_ch,
                prev_read_ch,
                &self.self_id,
                local_keys,
                self.config.l1_on_rehash,
            )
            .await
        {
            warn!(error = %err, "segment invalidation failed");
        }
    }

    /// Fetches any prepared transactions touching `segments`, then selects
    /// sources and enqueues one task per source, starting the pump.
    ///
    /// `read_ch` is the CH that reflects who actually holds the data today:
    /// during a rebalance this is the *old* CH, not the pending
    /// `write_ch` the node is migrating towards, since under replication
    /// factor 1 the write-CH's only owner for a newly-added segment is often
    /// this node itself.
    pub async fn add_transfers(
        self: &Arc<Self>,
        topology_id: TopologyId,
        read_ch: &Arc<crate::topology::ConsistentHash>,
        segments: Vec<SegmentId>,
    ) -> Result<()> {
        if segments.is_empty() {
            return Ok(());
        }
        let mut excluded = Vec::new();

        if self.config.mode.is_transactional() && !self.config.mode.is_total_order() {
            if let Some(fetcher) = &self.fetcher {
                fetcher
                    .fetch_all(topology_id, read_ch, &segments, &self.self_id, &mut excluded)
                    .await?;
            }
        }

        if !self.config.fetch_enabled() {
            return Ok(());
        }

        let grouped = group_by_source(read_ch, &segments, &self.self_id, &excluded);
        for (source, segs) in grouped {
            let seg_set: HashSet<SegmentId> = segs.into_iter().collect();
            let task = Arc::new(InboundTransferTask::new(
                source,
                seg_set.clone(),
                topology_id,
                self.rpc.clone(),
            ));
            self.registry.add_transfer(task, &seg_set);
        }

        let this = self.clone();
        self.pump.start(
            self.config.state_transfer_timeout,
            topology_id,
            read_ch.clone(),
            self.self_id.clone(),
            Arc::new(move |task| {
                let this = this.clone();
                tokio::spawn(async move {
                    this.registry.remove_transfer(&task);
                    this.notify_end_of_rebalance_if_needed(task.topology_id()).await;
                });
            }),
        );
        Ok(())
    }

    /// Applies every chunk in `chunks`, arriving from `sender` for
    /// `topology_id`, to local storage.
    pub async fn apply_state(
        self: &Arc<Self>,
        _sender: &NodeId,
        topology_id: TopologyId,
        chunks: Vec<StateChunk<K, V>>,
    ) -> Result<()> {
        let topology = self.topology.read().await.clone();
        if !topology.is_member(&self.self_id) {
            return Ok(());
        }
        for chunk in chunks {
            if !topology.write_ch.owns_segment(&self.self_id, chunk.segment_id) {
                warn!(segment = chunk.segment_id, topology_id, "dropping chunk: ownership mismatch");
                continue;
            }
            let Some(task) = self.find_task_for_segment(chunk.segment_id) else {
                warn!(segment = chunk.segment_id, "unsolicited chunk, no registered task");
                continue;
            };
            let is_last = chunk.is_last;
            let segment_id = chunk.segment_id;
            self.applier.apply_chunk(chunk, &topology.write_ch, &self.self_id).await?;
            task.on_state_received(segment_id, is_last);
            if task.status().is_terminal() {
                self.registry.remove_transfer(&task);
                self.notify_end_of_rebalance_if_needed(topology_id).await;
            }
        }
        Ok(())
    }

    fn find_task_for_segment(&self, segment: SegmentId) -> Option<Arc<InboundTransferTask<K, V>>> {
        // The registry doesn't expose its internal map directly; segments
        // still in flight are exactly those a task is registered for.
        self.registry.task_for_segment(segment)
    }

    async fn notify_end_of_rebalance_if_needed(&self, topology_id: TopologyId) {
        if !self.waiting_for_state.load(Ordering::SeqCst) {
            return;
        }
        if self.registry.has_active_transfers() {
            return;
        }
        if self
            .waiting_for_state
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.stop_applying_state();
            info!(topology_id, "rebalance complete");
        }
    }
}
