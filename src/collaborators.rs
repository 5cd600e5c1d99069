//! Contracts for everything this crate consumes from the rest of the cache.
//! Every collaborator is a trait so that tests exercise this crate
//! against small in-memory fakes instead of a running cluster, cache, or
//! disk-backed store — the same shape as this codebase's other `*Client` /
//! `*Storage` trait boundaries.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{NodeId, SegmentId, TopologyId};

/// A batch of entries for one segment from one source.
#[derive(Debug, Clone)]
pub struct StateChunk<K, V> {
    pub segment_id: SegmentId,
    pub entries: Option<Vec<(K, V)>>,
    pub is_last: bool,
}

/// A remote prepared transaction discovered by the Transaction Fetcher.
#[derive(Debug, Clone)]
pub struct TransactionInfo<K, V> {
    pub global_tx_id: Uuid,
    pub modifications: Vec<(K, V)>,
    pub locked_keys: Vec<K>,
}

/// RPC surface this crate needs from the cluster's transport + commands
/// factory (collapsed into one boundary — the real system's `RpcManager`
/// and `CommandsFactory` are separate collaborators, but from this crate's
/// point of view they are only ever used together to build and send exactly
/// these four request shapes).
#[async_trait]
pub trait RpcManager<K, V>: Send + Sync {
    /// `GET_TRANSACTIONS`: synchronously fetch prepared-but-uncommitted
    /// transactions touching `segments` from `target`.
    async fn request_transactions(
        &self,
        target: &NodeId,
        topology_id: TopologyId,
        segments: &[SegmentId],
    ) -> Result<Vec<TransactionInfo<K, V>>>;

    /// `START_STATE_TRANSFER`: ask `target` to begin streaming `segments`.
    /// Returns whether the source acknowledged and started.
    async fn start_state_transfer(
        &self,
        target: &NodeId,
        topology_id: TopologyId,
        segments: &[SegmentId],
    ) -> Result<bool>;

    /// `CANCEL_STATE_TRANSFER`: ask `target` to stop sending `segments`.
    async fn cancel_state_transfer(
        &self,
        target: &NodeId,
        topology_id: TopologyId,
        segments: &[SegmentId],
    ) -> Result<()>;

    /// `GET_CACHE_LISTENERS`: best-effort retrieval of cluster-listener
    /// registrations from a remote member, used only on first join.
    async fn request_cache_listeners(&self, target: &NodeId) -> Result<Vec<String>>;

    /// Timeout applied to every call above (`state_transfer_timeout`).
    fn timeout(&self) -> Duration;
}

/// Local command invocation during state application and invalidation.
#[async_trait]
pub trait InterceptorChain<K, V>: Send + Sync {
    /// Apply one key/value pair with the state-transfer write flags set
    /// (put-for-state-transfer, cache-mode-local, ignore-return-value,
    /// skip-remote-lookup, skip-shared-store, skip-ownership-check,
    /// skip-xsite-backup).
    async fn put_for_state_transfer(&self, key: K, value: V) -> Result<()>;

    /// `INVALIDATE`: drop `keys` entirely (cache-mode-local, skip-locking).
    async fn invalidate(&self, keys: Vec<K>) -> Result<()>;

    /// `INVALIDATE_L1`: demote `keys` to the L1 near-cache.
    async fn invalidate_l1(&self, keys: Vec<K>) -> Result<()>;
}

/// Enumerates keys currently held in the persistent store, so the Segment
/// Invalidator can sweep it the same way it sweeps the in-memory container.
/// The real collaborator's `process_on_all_stores(filter, task, fetch_value,
/// fetch_metadata)` is simplified here to key enumeration only — this crate
/// never needs the stored value or metadata, only the key, to decide whether
/// an entry should be removed or demoted.
#[async_trait]
pub trait PersistenceManager<K>: Send + Sync {
    async fn all_keys(&self) -> Result<Vec<K>>;
}

/// Opaque handle to a transaction started by the `TransactionManager`.
pub type TxHandle = u64;

/// Wraps individual entry applications in a transaction when the cache is
/// transactional. Absent in non-transactional mode — see
/// `Mode` in `config.rs`, which models that absence as a sum type instead of
/// an `Option` checked on every call.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<TxHandle>;
    async fn commit(&self, tx: TxHandle) -> Result<()>;
    async fn rollback(&self, tx: TxHandle) -> Result<()>;
    /// Whether `tx` is still live (used to decide whether a second rollback
    /// attempt after a failed one makes sense).
    async fn is_live(&self, tx: TxHandle) -> bool;
}

/// Transaction bookkeeping used by the Transaction Fetcher and by topology
/// updates to evict transactions whose originator left the cluster.
#[async_trait]
pub trait TransactionTable<K, V>: Send + Sync {
    async fn get_or_create_remote_transaction(
        &self,
        global_tx_id: Uuid,
        modifications: Vec<(K, V)>,
        lookup_topology_id: TopologyId,
    ) -> Result<()>;

    async fn register_backup_lock(&self, global_tx_id: Uuid, key: &K) -> Result<()>;

    async fn cleanup_stale_transactions(&self, current_members: &[NodeId]) -> Result<()>;
}

/// A single latch the total-order manager hands back from
/// `notify_state_transfer_start`, representing one in-flight remote
/// transaction that must drain before the topology change proceeds.
#[async_trait]
pub trait DrainLatch: Send + Sync {
    async fn await_drained(&self) -> Result<()>;
}

/// Required only when `Mode::TxTotalOrder` is configured.
#[async_trait]
pub trait TotalOrderManager: Send + Sync {
    async fn notify_state_transfer_start(
        &self,
        topology_id: TopologyId,
    ) -> Result<Vec<Box<dyn DrainLatch>>>;

    async fn notify_state_transfer_end(&self);
}

/// Registers near-cache invalidation requestors for a key.
pub trait L1Manager<K>: Send + Sync {
    fn add_requestor(&self, key: &K, node: NodeId);
}

/// Cache-notification sink for rehash start/end events.
pub trait Notifier: Send + Sync {
    fn notify_data_rehashed(&self, topology_id: TopologyId, is_pre: bool);
}

/// Per-node view of "all owners that used to hold this segment but no
/// longer do", used to build `HashMap<NodeId, Vec<TransactionInfo<..>>>`
/// results etc. Exposed for convenience to implementors of the traits above.
pub type PerSource<T> = HashMap<NodeId, T>;
