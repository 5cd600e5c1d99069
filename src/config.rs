use std::time::Duration;

use envconfig::Envconfig;

/// Collapses the scattered `is_transactional` / `is_total_order` /
/// `invalidation_mode` booleans a naive port would enumerate into one tagged
/// variant, so that every call site that needs to branch on cache semantics
/// matches on a single value instead of checking several independent flags
/// that could, in principle, disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Plain cache: no transactions, no invalidation semantics.
    NonTx,
    /// Transactional cache using two-phase commit.
    Tx,
    /// Transactional cache using the total-order protocol, which additionally
    /// requires draining in-flight transactions before a topology change.
    TxTotalOrder,
    /// Invalidation-mode cache: no state transfer of entries, only
    /// invalidation of keys the node no longer owns.
    Invalidation,
}

impl Mode {
    pub fn is_transactional(self) -> bool {
        matches!(self, Mode::Tx | Mode::TxTotalOrder)
    }

    pub fn is_total_order(self) -> bool {
        matches!(self, Mode::TxTotalOrder)
    }

    pub fn is_invalidation(self) -> bool {
        matches!(self, Mode::Invalidation)
    }
}

/// Structural + tunable configuration for one state consumer instance.
///
/// This is built once, at cache start, from the owning cache's
/// configuration; it is not itself parsed from the environment (the state
/// consumer is a library component, not a standalone service). The tunable
/// knobs below can, however, be overridden per-deployment via
/// [`StateConsumerEnvConfig`], the way the rest of this codebase's services
/// read their timeouts and capacities from the environment.
#[derive(Debug, Clone)]
pub struct StateConsumerConfig {
    pub mode: Mode,
    pub fetch_in_memory_state: bool,
    pub fetch_persistent_state: bool,
    pub l1_on_rehash: bool,
    pub state_transfer_timeout: Duration,
    pub transfer_chunk_buffer: usize,
}

impl StateConsumerConfig {
    pub fn fetch_enabled(&self) -> bool {
        self.fetch_in_memory_state || self.fetch_persistent_state
    }
}

impl Default for StateConsumerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::NonTx,
            fetch_in_memory_state: true,
            fetch_persistent_state: false,
            l1_on_rehash: false,
            state_transfer_timeout: Duration::from_secs(240),
            transfer_chunk_buffer: 64,
        }
    }
}

/// Environment-overridable tunable knobs, loaded once at process start and
/// merged into a [`StateConsumerConfig`] via [`StateConsumerEnvConfig::apply`].
#[derive(Envconfig, Debug, Clone)]
pub struct StateConsumerEnvConfig {
    #[envconfig(from = "STATE_TRANSFER_TIMEOUT_SECS", default = "240")]
    pub state_transfer_timeout_secs: u64,

    #[envconfig(from = "STATE_TRANSFER_CHUNK_BUFFER", default = "64")]
    pub transfer_chunk_buffer: usize,

    #[envconfig(from = "STATE_TRANSFER_L1_ON_REHASH", default = "false")]
    pub l1_on_rehash: bool,
}

impl StateConsumerEnvConfig {
    pub fn apply(&self, base: &mut StateConsumerConfig) {
        base.state_transfer_timeout = Duration::from_secs(self.state_transfer_timeout_secs);
        base.transfer_chunk_buffer = self.transfer_chunk_buffer;
        base.l1_on_rehash = self.l1_on_rehash;
    }
}
