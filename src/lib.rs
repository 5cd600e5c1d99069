//! Incoming side of segment rebalancing for a partitioned in-memory cache.
//!
//! When cluster membership or segment ownership changes, this crate
//! reconciles the new topology, selects remote sources, fetches any
//! prepared transactions and entry chunks, applies them locally while
//! preserving "user write wins", cancels or retries broken transfers, and
//! reports rebalance completion. It is a library embedded in a larger cache
//! process: transport, persistence, command invocation, and cluster
//! membership are all consumed as traits (see [`collaborators`]), never
//! owned here.

pub mod applier;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod invalidator;
pub mod pump;
pub mod reactor;
pub mod registry;
pub mod source_selector;
pub mod task;
pub mod topology;
pub mod transaction_fetcher;
pub mod types;
pub mod updated_keys;

pub use collaborators::{
    DrainLatch, InterceptorChain, L1Manager, Notifier, PersistenceManager, RpcManager,
    StateChunk, TotalOrderManager, TransactionInfo, TransactionManager, TransactionTable,
    TxHandle,
};
pub use config::{Mode, StateConsumerConfig, StateConsumerEnvConfig};
pub use error::{ApplyError, Result, StateConsumerError};
pub use reactor::{Collaborators, RebalanceCoordinator};
pub use task::{InboundTransferTask, TaskStatus};
pub use topology::{ConsistentHash, Topology};
pub use types::{NodeId, SegmentId, TopologyId};
