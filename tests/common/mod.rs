//! In-memory fakes for every collaborator trait, so integration tests never
//! talk to a real cluster, cache, or disk-backed store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use state_consumer::{
    DrainLatch, InterceptorChain, L1Manager, Notifier, PersistenceManager, Result, RpcManager,
    StateConsumerError, TotalOrderManager, TransactionInfo, TransactionManager, TransactionTable,
    TxHandle, NodeId, SegmentId, TopologyId,
};

/// Source behavior one `FakeRpc` target can be configured with.
#[derive(Clone)]
pub enum SourceBehavior {
    Healthy,
    Unreachable,
}

pub struct FakeRpc<K, V> {
    pub behaviors: Mutex<HashMap<String, SourceBehavior>>,
    pub transactions: Mutex<HashMap<String, Vec<TransactionInfo<K, V>>>>,
    pub started: Mutex<Vec<(String, Vec<SegmentId>)>>,
    pub cancelled: Mutex<Vec<(String, Vec<SegmentId>)>>,
    pub timeout: Duration,
}

impl<K, V> Default for FakeRpc<K, V> {
    fn default() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            timeout: Duration::from_millis(500),
        }
    }
}

impl<K, V> FakeRpc<K, V> {
    pub fn mark_unreachable(&self, node: &str) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(node.to_string(), SourceBehavior::Unreachable);
    }

    fn is_unreachable(&self, node: &NodeId) -> bool {
        matches!(
            self.behaviors.lock().unwrap().get(&node.0),
            Some(SourceBehavior::Unreachable)
        )
    }
}

#[async_trait]
impl<K, V> RpcManager<K, V> for FakeRpc<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn request_transactions(
        &self,
        target: &NodeId,
        _topology_id: TopologyId,
        _segments: &[SegmentId],
    ) -> Result<Vec<TransactionInfo<K, V>>> {
        if self.is_unreachable(target) {
            return Err(StateConsumerError::TransportFailure {
                target: target.clone(),
                source: anyhow::anyhow!("unreachable in test"),
            });
        }
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .get(&target.0)
            .cloned()
            .unwrap_or_default())
    }

    async fn start_state_transfer(
        &self,
        target: &NodeId,
        _topology_id: TopologyId,
        segments: &[SegmentId],
    ) -> Result<bool> {
        if self.is_unreachable(target) {
            return Err(StateConsumerError::TransportFailure {
                target: target.clone(),
                source: anyhow::anyhow!("unreachable in test"),
            });
        }
        self.started
            .lock()
            .unwrap()
            .push((target.0.clone(), segments.to_vec()));
        Ok(true)
    }

    async fn cancel_state_transfer(
        &self,
        target: &NodeId,
        _topology_id: TopologyId,
        segments: &[SegmentId],
    ) -> Result<()> {
        self.cancelled
            .lock()
            .unwrap()
            .push((target.0.clone(), segments.to_vec()));
        Ok(())
    }

    async fn request_cache_listeners(&self, _target: &NodeId) -> Result<Vec<String>> {
        Ok(vec![])
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Records every local write, invalidation, and L1 demotion so tests can
/// assert on exactly what reached local storage.
#[derive(Default)]
pub struct RecordingInterceptors<K, V> {
    pub applied: Mutex<Vec<(K, V)>>,
    pub invalidated: Mutex<Vec<K>>,
    pub demoted: Mutex<Vec<K>>,
}

#[async_trait]
impl<K, V> InterceptorChain<K, V> for RecordingInterceptors<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn put_for_state_transfer(&self, key: K, value: V) -> Result<()> {
        self.applied.lock().unwrap().push((key, value));
        Ok(())
    }

    async fn invalidate(&self, keys: Vec<K>) -> Result<()> {
        self.invalidated.lock().unwrap().extend(keys);
        Ok(())
    }

    async fn invalidate_l1(&self, keys: Vec<K>) -> Result<()> {
        self.demoted.lock().unwrap().extend(keys);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePersistence<K> {
    pub keys: Mutex<Vec<K>>,
}

#[async_trait]
impl<K> PersistenceManager<K> for FakePersistence<K>
where
    K: Clone + Send + Sync + 'static,
{
    async fn all_keys(&self) -> Result<Vec<K>> {
        Ok(self.keys.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeTransactionManager {
    next: AtomicU64,
    live: Mutex<std::collections::HashSet<TxHandle>>,
}

#[async_trait]
impl TransactionManager for FakeTransactionManager {
    async fn begin(&self) -> Result<TxHandle> {
        let handle = self.next.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().insert(handle);
        Ok(handle)
    }

    async fn commit(&self, tx: TxHandle) -> Result<()> {
        self.live.lock().unwrap().remove(&tx);
        Ok(())
    }

    async fn rollback(&self, tx: TxHandle) -> Result<()> {
        self.live.lock().unwrap().remove(&tx);
        Ok(())
    }

    async fn is_live(&self, tx: TxHandle) -> bool {
        self.live.lock().unwrap().contains(&tx)
    }
}

#[derive(Default)]
pub struct FakeTransactionTable<K, V> {
    pub registered: Mutex<Vec<(Uuid, Vec<(K, V)>)>>,
    pub locks: Mutex<Vec<(Uuid, K)>>,
    pub cleaned_up: Mutex<Vec<Vec<NodeId>>>,
}

#[async_trait]
impl<K, V> TransactionTable<K, V> for FakeTransactionTable<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get_or_create_remote_transaction(
        &self,
        global_tx_id: Uuid,
        modifications: Vec<(K, V)>,
        _lookup_topology_id: TopologyId,
    ) -> Result<()> {
        self.registered.lock().unwrap().push((global_tx_id, modifications));
        Ok(())
    }

    async fn register_backup_lock(&self, global_tx_id: Uuid, key: &K) -> Result<()> {
        self.locks.lock().unwrap().push((global_tx_id, key.clone()));
        Ok(())
    }

    async fn cleanup_stale_transactions(&self, current_members: &[NodeId]) -> Result<()> {
        self.cleaned_up.lock().unwrap().push(current_members.to_vec());
        Ok(())
    }
}

pub struct InstantLatch;

#[async_trait]
impl DrainLatch for InstantLatch {
    async fn await_drained(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTotalOrderManager {
    pub start_calls: Mutex<Vec<TopologyId>>,
    pub end_calls: Mutex<u64>,
}

#[async_trait]
impl TotalOrderManager for FakeTotalOrderManager {
    async fn notify_state_transfer_start(
        &self,
        topology_id: TopologyId,
    ) -> Result<Vec<Box<dyn DrainLatch>>> {
        self.start_calls.lock().unwrap().push(topology_id);
        Ok(vec![Box::new(InstantLatch)])
    }

    async fn notify_state_transfer_end(&self) {
        *self.end_calls.lock().unwrap() += 1;
    }
}

#[derive(Default)]
pub struct FakeL1Manager<K> {
    pub requestors: Mutex<Vec<(K, NodeId)>>,
}

impl<K: Clone + Send + Sync + 'static> L1Manager<K> for FakeL1Manager<K> {
    fn add_requestor(&self, key: &K, node: NodeId) {
        self.requestors.lock().unwrap().push((key.clone(), node));
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    pub events: Mutex<Vec<(TopologyId, bool)>>,
}

impl Notifier for FakeNotifier {
    fn notify_data_rehashed(&self, topology_id: TopologyId, is_pre: bool) {
        self.events.lock().unwrap().push((topology_id, is_pre));
    }
}
