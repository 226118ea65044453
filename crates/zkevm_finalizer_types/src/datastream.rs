use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};

/// Entries written to the data stream, in per-block commit order. A batch is
/// framed as `BookmarkBatch, BatchStart, (BookmarkL2Block, L2Block,
/// Transaction*)*, BatchEnd`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StreamEntry {
    BookmarkBatch { batch_number: u64 },
    BookmarkL2Block { l2_block_number: u64 },
    BatchStart(StreamBatchStart),
    L2Block(StreamL2Block),
    Transaction(StreamTransaction),
    BatchEnd(StreamBatchEnd),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamBatchStart {
    pub batch_number: u64,
    pub coinbase: Address,
    pub fork_id: u64,
    pub is_forced: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamL2Block {
    pub batch_number: u64,
    pub l2_block_number: u64,
    pub block_hash: B256,
    pub state_root: B256,
    pub timestamp: u64,
    pub delta_timestamp: u32,
    pub l1_info_tree_index: u32,
    pub global_exit_root: B256,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamTransaction {
    pub l2_block_number: u64,
    pub hash: B256,
    pub encoded: Bytes,
    pub effective_gas_price_percentage: u8,
    pub is_valid: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamBatchEnd {
    pub batch_number: u64,
    pub state_root: B256,
    pub local_exit_root: B256,
}
