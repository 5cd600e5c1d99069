//! Drops or demotes entries for segments this node no longer owns, once a
//! rebalance completes.

use std::hash::Hash;
use std::sync::Arc;

use tracing::{debug, info};

use crate::collaborators::{InterceptorChain, L1Manager, PersistenceManager};
use crate::error::Result;
use crate::source_selector::segments_for_keys;
use crate::topology::ConsistentHash;
use crate::types::NodeId;

pub struct SegmentInvalidator<K, V> {
    interceptors: Arc<dyn InterceptorChain<K, V>>,
    persistence: Option<Arc<dyn PersistenceManager<K>>>,
    l1: Option<Arc<dyn L1Manager<K>>>,
}

impl<K, V> SegmentInvalidator<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(
        interceptors: Arc<dyn InterceptorChain<K, V>>,
        persistence: Option<Arc<dyn PersistenceManager<K>>>,
        l1: Option<Arc<dyn L1Manager<K>>>,
    ) -> Self {
        Self {
            interceptors,
            persistence,
            l1,
        }
    }

    /// Sweeps `local_keys` (the in-memory container's key set) plus, if a
    /// persistence manager is configured, every key in the persistent store.
    /// A key whose segment is no longer owned under `write_ch` is either
    /// invalidated outright, or — if `l1_on_rehash` is set — kept as an L1
    /// near-cache entry with near-cache requestors registered for the nodes
    /// that now own it.
    ///
    /// For segments this node still owns, `prev_ch` (the CH in effect before
    /// this topology change) is consulted too: any node that used to own such
    /// a segment but no longer does is registered as an L1 requestor for
    /// every key in it, so a future update to that key reaches a node that
    /// may still be holding a now-stale near-cache copy.
    pub async fn invalidate_segments(
        &self,
        write_ch: &ConsistentHash,
        prev_ch: &ConsistentHash,
        self_id: &NodeId,
        local_keys: Vec<K>,
        l1_on_rehash: bool,
    ) -> Result<usize> {
        let mut keys = local_keys;
        if let Some(persistence) = &self.persistence {
            keys.extend(persistence.all_keys().await?);
        }
        let deduped: std::collections::HashSet<K> = keys.into_iter().collect();

        let by_segment = segments_for_keys(write_ch, deduped);
        let mut to_invalidate = Vec::new();
        let mut to_l1 = Vec::new();
        for (segment, segment_keys) in by_segment {
            if write_ch.owns_segment(self_id, segment) {
                if l1_on_rehash {
                    self.register_stale_requestors(segment, &segment_keys, write_ch, prev_ch);
                }
                continue;
            }
            if l1_on_rehash {
                if let Some(l1) = &self.l1 {
                    for owner in write_ch.owners(segment) {
                        for key in &segment_keys {
                            l1.add_requestor(key, owner.clone());
                        }
                    }
                }
                debug!(segment, count = segment_keys.len(), "queued segment for L1 demotion");
                to_l1.extend(segment_keys);
            } else {
                to_invalidate.extend(segment_keys);
            }
        }

        let l1_count = to_l1.len();
        if !to_l1.is_empty() {
            self.interceptors.invalidate_l1(to_l1).await?;
        }

        let count = to_invalidate.len();
        if !to_invalidate.is_empty() {
            self.interceptors.invalidate(to_invalidate).await?;
        }
        info!(count, l1_count, "invalidated entries for segments no longer owned");
        Ok(count)
    }

    /// For a segment still owned locally, find owners from `prev_ch` that
    /// dropped out of `write_ch`'s owner list and register them as L1
    /// requestors for every key in the segment.
    fn register_stale_requestors(
        &self,
        segment: crate::types::SegmentId,
        segment_keys: &[K],
        write_ch: &ConsistentHash,
        prev_ch: &ConsistentHash,
    ) {
        let Some(l1) = &self.l1 else { return };
        let current_owners = write_ch.owners(segment);
        for former_owner in prev_ch.owners(segment) {
            if current_owners.contains(former_owner) {
                continue;
            }
            for key in segment_keys {
                l1.add_requestor(key, former_owner.clone());
            }
        }
    }
}
