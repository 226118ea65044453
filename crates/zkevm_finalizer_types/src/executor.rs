use std::collections::BTreeMap;

use alloy_primitives::{Address, Bytes, B256, U256};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::resources::ZkCounters;

/// Highest value of the one-byte effective percentage: the tx is billed at
/// its full gas price.
pub const MAX_EFFECTIVE_PERCENTAGE: u8 = 255;

/// Encoded size of a changeL2Block marker: 1 byte tx type + 4 bytes
/// deltaTimestamp + 4 bytes l1InfoTreeIndex.
pub const CHANGE_L2_BLOCK_SIZE: u64 = 9;

/// L1 info tree leaf data forwarded to the executor for a changeL2Block call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct L1InfoTreeLeaf {
    pub global_exit_root: B256,
    pub block_hash: B256,
    pub min_timestamp: u64,
}

/// Request for a `ProcessBatch` executor call. For mid-batch single-tx calls
/// all three skip flags are set; for the block-assembly call they are not.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub batch_number: u64,
    pub old_state_root: B256,
    pub coinbase: Address,
    pub fork_id: u64,
    pub timestamp_limit: u64,
    pub l1_info_root: B256,
    /// Raw tx bytes; single-tx requests carry the one-byte effective
    /// percentage suffix appended to the RLP.
    pub transactions: Bytes,
    pub skip_first_change_l2_block: bool,
    pub skip_write_block_info_root: bool,
    pub skip_verify_l1_info_root: bool,
    pub l1_info_tree_data: BTreeMap<u32, L1InfoTreeLeaf>,
}

/// Post-state of an account touched by a tx, as reported by the executor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub nonce: Option<u64>,
    pub balance: Option<U256>,
}

pub type ReadWriteAddresses = IndexMap<Address, AccountUpdate>;

/// Failure classification of the executor's zk-VM micro-runtime.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum RomError {
    IntrinsicInvalidNonce,
    IntrinsicInvalidBalance,
    IntrinsicInvalidSignature,
    IntrinsicInvalidChainId,
    IntrinsicInvalidGasLimit,
    OutOfCountersKeccak,
    OutOfCountersPoseidon,
    OutOfCountersPadding,
    OutOfCountersMemAlign,
    OutOfCountersArith,
    OutOfCountersBinary,
    OutOfCountersSha256,
    OutOfCountersSteps,
    OutOfGas,
    ExecutionReverted,
    InvalidRlp,
}

impl RomError {
    pub fn is_intrinsic(&self) -> bool {
        matches!(
            self,
            RomError::IntrinsicInvalidNonce
                | RomError::IntrinsicInvalidBalance
                | RomError::IntrinsicInvalidSignature
                | RomError::IntrinsicInvalidChainId
                | RomError::IntrinsicInvalidGasLimit
        )
    }

    pub fn is_intrinsic_nonce(&self) -> bool {
        matches!(self, RomError::IntrinsicInvalidNonce)
    }

    pub fn is_intrinsic_balance(&self) -> bool {
        matches!(self, RomError::IntrinsicInvalidBalance)
    }

    pub fn is_out_of_counters(&self) -> bool {
        matches!(
            self,
            RomError::OutOfCountersKeccak
                | RomError::OutOfCountersPoseidon
                | RomError::OutOfCountersPadding
                | RomError::OutOfCountersMemAlign
                | RomError::OutOfCountersArith
                | RomError::OutOfCountersBinary
                | RomError::OutOfCountersSha256
                | RomError::OutOfCountersSteps
        )
    }

    pub fn is_out_of_gas(&self) -> bool {
        matches!(self, RomError::OutOfGas)
    }

    /// Whether a tx failing with this error still advances the state root
    /// (and must therefore be included in the block). Intrinsic errors,
    /// out-of-counters and undecodable txs never advance the root.
    pub fn changes_state_root(&self) -> bool {
        !(self.is_intrinsic() || self.is_out_of_counters() || matches!(self, RomError::InvalidRlp))
    }
}

/// Per-tx result inside a block response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub tx_hash: B256,
    pub from: Address,
    pub rom_error: Option<RomError>,
    pub gas_used: u64,
    pub state_root: B256,
    pub has_gas_price_opcode: bool,
    pub has_balance_opcode: bool,
    pub return_value: Bytes,
}

impl TransactionResponse {
    pub fn changes_state_root(&self) -> bool {
        self.rom_error.map_or(true, |e| e.changes_state_root())
    }
}

/// Per-block result of a `ProcessBatch` call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockResponse {
    pub block_number: u64,
    pub block_hash: B256,
    pub timestamp: u64,
    pub transaction_responses: Vec<TransactionResponse>,
}

/// Response of a `ProcessBatch` executor call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub new_state_root: B256,
    pub block_responses: Vec<BlockResponse>,
    pub used_zk_counters: ZkCounters,
    pub reserved_zk_counters: ZkCounters,
    pub read_write_addresses: ReadWriteAddresses,
    pub is_rom_level_error: bool,
    /// Durability cursor assigned by the executor to this unit of work.
    pub flush_id: u64,
    pub prover_id: String,
    pub context_id: String,
}

impl ProcessResponse {
    /// The single tx response of a single-tx request, if present.
    pub fn first_tx_response(&self) -> Option<&TransactionResponse> {
        self.block_responses.first().and_then(|block| block.transaction_responses.first())
    }
}
