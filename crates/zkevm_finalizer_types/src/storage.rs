use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::executor::RomError;
use crate::resources::{BatchResources, ZkCounters};

/// Why a batch stopped accepting transactions. Once set, the batch is
/// immutable.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum ClosingReason {
    BatchFull,
    MaxTxs,
    TimestampResolutionExceeded,
    ForcedBatchDeadline,
    NoTxFits,
    L1InfoTreeIndexChanged,
    Halt,
}

/// Lifecycle of a batch in the store. `Checked` means the closed batch was
/// re-executed and its final state root confirmed.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum BatchStage {
    #[default]
    Open,
    Closing,
    Closed,
    Checked,
}

/// An L1 block header as mirrored in the local store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct L1Block {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
}

/// Header of a persisted L2 block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct L2BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub state_root: B256,
    pub timestamp: u64,
}

/// A transaction as persisted inside a stored L2 block, including the
/// effective-gas-price fields the proof pipeline replays.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub hash: B256,
    pub from: Address,
    pub nonce: u64,
    pub encoded: Bytes,
    pub egp_percentage: u8,
    pub effective_gas_price: U256,
    pub gas_used: u64,
    pub rom_error: Option<RomError>,
    pub state_root: B256,
}

/// A closed L2 block ready to be persisted atomically with its transactions
/// and receipts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredL2Block {
    pub batch_number: u64,
    pub header: L2BlockHeader,
    pub delta_timestamp: u32,
    pub l1_info_tree_index: u32,
    pub global_exit_root: B256,
    pub flush_id: u64,
    pub transactions: Vec<StoredTransaction>,
}

/// A batch row in the append-only store. Open batches carry their in-progress
/// accounting so a restarted finalizer can resume them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedBatch {
    pub batch_number: u64,
    pub coinbase: Address,
    pub initial_state_root: B256,
    pub final_state_root: B256,
    pub global_exit_root: B256,
    pub l1_info_tree_index: u32,
    pub timestamp: u64,
    pub fork_id: u64,
    pub count_of_txs: usize,
    pub count_of_l2_blocks: u64,
    pub remaining_resources: BatchResources,
    pub high_reserved_zk_counters: ZkCounters,
    pub closing_reason: Option<ClosingReason>,
    pub stage: BatchStage,
    pub is_forced: bool,
    pub l2_blocks: Vec<StoredL2Block>,
}
