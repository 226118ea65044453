use alloy_primitives::{Bytes, B256};
use serde::{Deserialize, Serialize};

/// A batch submitted directly to L1 that must be sequenced before its
/// inclusion deadline elapses.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ForcedBatch {
    pub forced_batch_number: u64,
    pub global_exit_root: B256,
    /// Concatenated RLP of the forced transactions.
    pub raw_txs: Bytes,
    /// Unix timestamp at which the batch was forced on L1.
    pub forced_at: u64,
    pub l1_block_number: u64,
}
