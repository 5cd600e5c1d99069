//! Applies received chunks to local storage, honoring "user write wins" and
//! the ownership gate.

use std::hash::Hash;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::collaborators::{InterceptorChain, StateChunk, TransactionManager};
use crate::config::Mode;
use crate::error::{ApplyError, Result};
use crate::topology::ConsistentHash;
use crate::types::NodeId;
use crate::updated_keys::UpdatedKeysHolder;

pub struct StateApplier<K, V> {
    interceptors: Arc<dyn InterceptorChain<K, V>>,
    updated_keys: Arc<UpdatedKeysHolder<K>>,
    tx_manager: Option<Arc<dyn TransactionManager>>,
    mode: Mode,
}

impl<K, V> StateApplier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(
        interceptors: Arc<dyn InterceptorChain<K, V>>,
        updated_keys: Arc<UpdatedKeysHolder<K>>,
        tx_manager: Option<Arc<dyn TransactionManager>>,
        mode: Mode,
    ) -> Self {
        Self {
            interceptors,
            updated_keys,
            tx_manager,
            mode,
        }
    }

    /// Applies every entry in `chunk`, skipping entries whose segment this
    /// node no longer owns under `write_ch` (an ownership change that raced
    /// the transfer wins over a late-arriving chunk) and entries whose key
    /// was written locally since the rebalance started.
    ///
    /// Each entry gets its own invocation context — a fresh transaction per
    /// entry in transactional mode, not one transaction for the whole chunk
    /// — so a failure applying one key rolls back only that key's write and
    /// the remaining entries in the chunk are still applied; other entries
    /// in the chunk continue and the transfer as a whole is not failed.
    pub async fn apply_chunk(
        &self,
        chunk: StateChunk<K, V>,
        write_ch: &ConsistentHash,
        self_id: &NodeId,
    ) -> Result<()> {
        let Some(entries) = chunk.entries else {
            return Ok(());
        };
        if !write_ch.owns_segment(self_id, chunk.segment_id) {
            debug!(segment = chunk.segment_id, "segment no longer owned locally, dropping chunk");
            return Ok(());
        }

        let mut applied = 0usize;
        let mut failures = 0usize;
        for (key, value) in entries {
            if self.updated_keys.is_key_updated(&key) {
                continue;
            }
            if self.apply_one(key, value).await {
                applied += 1;
            } else {
                failures += 1;
            }
        }

        debug!(segment = chunk.segment_id, applied, failures, "applied state chunk");
        Ok(())
    }

    /// Applies a single entry inside its own invocation context. Returns
    /// whether the write succeeded; a failure is logged per-key and never
    /// propagated, so the caller can keep going through the rest of the
    /// chunk.
    async fn apply_one(&self, key: K, value: V) -> bool {
        let tx = if self.mode.is_transactional() {
            match &self.tx_manager {
                Some(mgr) => match mgr.begin().await {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        warn!(error = %err, "failed to begin per-entry transaction, dropping entry");
                        return false;
                    }
                },
                None => None,
            }
        } else {
            None
        };

        let result = self.interceptors.put_for_state_transfer(key, value).await;

        if let (Some(handle), Some(mgr)) = (tx, &self.tx_manager) {
            let rollback_needed = result.is_err();
            if rollback_needed {
                if mgr.is_live(handle).await {
                    let _ = mgr.rollback(handle).await;
                }
            } else if let Err(err) = mgr.commit(handle).await {
                warn!(error = %err, "commit failed for applied entry");
                return false;
            }
        }

        if let Err(err) = result {
            let wrapped: ApplyError = ApplyError { cause: err.into() };
            warn!(error = %wrapped, "failed applying one entry during state transfer");
            return false;
        }
        true
    }
}
