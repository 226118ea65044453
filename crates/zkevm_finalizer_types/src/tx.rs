use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::resources::ZkCounters;

/// The unit of work drawn from the worker pool. Owned by the worker until it
/// is handed to the finalizer; returned on reprocess-or-reject.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TxTracker {
    pub hash: B256,
    pub from: Address,
    pub nonce: u64,
    pub gas_price: U256,
    /// L1/L2 gas prices snapshotted from the pool on first processing, pinned
    /// for the lifespan of the transaction.
    pub l1_gas_price: u64,
    pub l2_gas_price: u64,
    /// RLP-encoded transaction bytes.
    pub raw_tx: Bytes,
    pub used_zk_counters: ZkCounters,
    pub reserved_zk_counters: ZkCounters,
    pub effective_gas_price: U256,
    pub egp_percentage: u8,
    /// Set once no further effective-gas-price reprocess is expected.
    pub is_last_execution: bool,
    pub egp_log: EgpLog,
}

impl TxTracker {
    pub fn size(&self) -> u64 {
        self.raw_tx.len() as u64
    }
}

/// Trace record of the effective-gas-price computation for a tx, kept for the
/// egp-log line emitted when the tx is added to a block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EgpLog {
    pub value_first: U256,
    pub value_second: U256,
    pub value_final: U256,
    pub gas_price: U256,
    pub l1_gas_price: u64,
    pub l2_gas_price: u64,
    pub gas_used_first: u64,
    pub gas_used_second: u64,
    pub final_deviation: U256,
    pub max_deviation: U256,
    pub percentage: u8,
    pub reprocess: bool,
    pub gas_price_opcode: bool,
    pub balance_opcode: bool,
    pub enabled: bool,
    pub error: Option<String>,
}
