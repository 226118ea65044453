use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

/// Snapshot of the latest synced L1 info tree leaf. Index 0 is the empty-tree
/// sentinel: its global exit root is forced to zero and it is never validated
/// against L1.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct L1InfoTreeUpdate {
    pub root: B256,
    pub index: u32,
    pub global_exit_root: B256,
    /// L1 block in which the leaf was added.
    pub block_number: u64,
    /// Minimum timestamp a block pinning this leaf may carry.
    pub min_timestamp: u64,
}

impl L1InfoTreeUpdate {
    pub fn is_empty_tree_sentinel(&self) -> bool {
        self.index == 0
    }
}
