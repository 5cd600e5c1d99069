//! Pulls in-flight prepared transactions from remote owners before state
//! transfer begins, so that a transaction prepared-but-not-committed on the
//! old owner is not lost.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::collaborators::{RpcManager, TransactionTable};
use crate::error::Result;
use crate::source_selector::group_by_source;
use crate::topology::ConsistentHash;
use crate::types::{NodeId, SegmentId, TopologyId};

pub struct TransactionFetcher<K, V> {
    rpc: Arc<dyn RpcManager<K, V>>,
    table: Arc<dyn TransactionTable<K, V>>,
}

impl<K, V> TransactionFetcher<K, V> {
    pub fn new(rpc: Arc<dyn RpcManager<K, V>>, table: Arc<dyn TransactionTable<K, V>>) -> Self {
        Self { rpc, table }
    }

    /// Fetches prepared transactions touching `segments` before the entry
    /// pull begins. Each round groups the segments not yet fetched by source
    /// (via `group_by_source`, honoring `excluded`), issues one
    /// `GET_TRANSACTIONS` per source, and registers every returned
    /// transaction plus its backup locks in the local transaction table.
    ///
    /// A source whose RPC fails is added to `excluded` in place and its
    /// segments are retried against the next-best owner on the following
    /// round, same as a failed segment transfer is in `pump.rs`. The loop
    /// ends once a round fetches every remaining segment, or once
    /// `group_by_source` can no longer find a source for what is left.
    pub async fn fetch_all(
        &self,
        topology_id: TopologyId,
        read_ch: &ConsistentHash,
        segments: &[SegmentId],
        self_id: &NodeId,
        excluded: &mut Vec<NodeId>,
    ) -> Result<usize> {
        let mut remaining: Vec<SegmentId> = segments.to_vec();
        let mut fetched = 0;

        loop {
            if remaining.is_empty() {
                return Ok(fetched);
            }
            let grouped = group_by_source(read_ch, &remaining, self_id, excluded);
            if grouped.is_empty() {
                return Ok(fetched);
            }

            let mut failed = Vec::new();
            for (source, segs) in &grouped {
                match self
                    .rpc
                    .request_transactions(source, topology_id, segs)
                    .await
                {
                    Ok(transactions) => {
                        debug!(source = %source, count = transactions.len(), "fetched prepared transactions");
                        for tx in transactions {
                            self.table
                                .get_or_create_remote_transaction(
                                    tx.global_tx_id,
                                    tx.modifications,
                                    topology_id,
                                )
                                .await?;
                            for key in &tx.locked_keys {
                                self.table.register_backup_lock(tx.global_tx_id, key).await?;
                            }
                            fetched += 1;
                        }
                    }
                    Err(err) => {
                        warn!(source = %source, error = %err, "failed to fetch transactions from source, retrying against next owner");
                        excluded.push(source.clone());
                        failed.extend(segs.iter().copied());
                    }
                }
            }

            if failed.is_empty() {
                return Ok(fetched);
            }
            remaining = failed;
        }
    }
}
