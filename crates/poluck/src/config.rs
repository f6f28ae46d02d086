use std::time::Duration;

use crate::enclave::DEFAULT_ROUND_TIME;

/// Parameters the consensus core takes from the host.
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    /// Minimum round length, also the keepalive interval.
    pub round_time: Duration,
    /// Blocks below this luck do not count towards a chain's weight.
    pub min_luck: f64,
    /// Mine parent-only payloads when the mempool is empty.
    pub allow_empty_blocks: bool,
    pub max_mempool: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            round_time: DEFAULT_ROUND_TIME,
            min_luck: 0.0,
            allow_empty_blocks: true,
            max_mempool: 10_000,
        }
    }
}
