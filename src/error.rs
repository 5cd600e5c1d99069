use thiserror::Error;

use crate::types::{NodeId, SegmentId, TopologyId};

/// Structured errors raised by the state consumer.
///
/// Network and per-entry failures are handled internally (retried or logged)
/// and rarely surface this type to a caller; it exists mainly so that the
/// handful of cases that *do* need to be matched on (interruption, a fatal
/// persistence-enumeration failure) are typed rather than stringly-typed.
#[derive(Error, Debug)]
pub enum StateConsumerError {
    #[error("rpc to {target} failed: {source}")]
    TransportFailure {
        target: NodeId,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to apply entry for key during state transfer: {0}")]
    ApplicationFailure(#[source] anyhow::Error),

    #[error("chunk for segment {segment} arrived with no registered transfer task")]
    UnsolicitedChunk { segment: SegmentId },

    #[error("chunk for segment {segment} rejected: node does not own it under topology {topology_id}")]
    OwnershipMismatch {
        segment: SegmentId,
        topology_id: TopologyId,
    },

    #[error("best-effort cluster-listener retrieval from {target} failed: {source}")]
    ListenerInstallFailure {
        target: NodeId,
        #[source]
        source: anyhow::Error,
    },

    #[error("state consumer operation was interrupted")]
    Interrupted,

    #[error("fatal state consumer error: {0}")]
    Fatal(#[source] anyhow::Error),

    #[error("rejected topology {received} older than current {current}")]
    StaleTopology {
        received: TopologyId,
        current: TopologyId,
    },
}

pub type Result<T> = std::result::Result<T, StateConsumerError>;

/// Per-entry failure collected while applying a chunk. A handful of these can
/// accumulate while the chunk as a whole still succeeds: one bad entry does
/// not fail the transfer.
#[derive(Error, Debug)]
#[error("failed to apply key: {cause}")]
pub struct ApplyError {
    pub cause: anyhow::Error,
}

impl From<ApplyError> for StateConsumerError {
    fn from(err: ApplyError) -> Self {
        StateConsumerError::ApplicationFailure(err.cause)
    }
}
