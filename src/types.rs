use std::fmt;

/// One of the fixed number of partitions a key hashes into.
pub type SegmentId = u32;

/// Monotonically increasing identifier of a topology snapshot.
pub type TopologyId = u64;

/// Identity of a cluster member, as handed to us by the topology manager.
///
/// This is deliberately a thin wrapper around whatever the RPC layer already
/// uses to address a peer (an address, a UUID, a logical name); the state
/// consumer never interprets it beyond equality and hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
