use std::time::Duration;

use alloy_primitives::{Address, B256};
use tokio::time::Instant;
use zkevm_finalizer_types::datastream::{
    StreamBatchEnd,
    StreamBatchStart,
    StreamEntry,
    StreamL2Block,
    StreamTransaction,
};
use zkevm_finalizer_types::executor::TransactionResponse;
use zkevm_finalizer_types::l1_info_tree::L1InfoTreeUpdate;
use zkevm_finalizer_types::storage::{ClosingReason, L2BlockHeader, StoredL2Block, StoredTransaction};
use zkevm_finalizer_types::tx::TxTracker;

use crate::batch::Batch;

/// Wall-clock accounting of a WIP L2 block, published when the block closes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockMetrics {
    pub idle_time: Duration,
    pub executor_time: Duration,
    pub processed_tx_count: u64,
    pub gas: u64,
}

/// A tx accepted into the block together with its executor response.
#[derive(Clone, Debug)]
pub struct ProcessedTx {
    pub tracker: TxTracker,
    pub response: TransactionResponse,
}

/// The work-in-progress L2 block. Owned by exactly one batch; closed when the
/// block max-delta-timestamp elapses, the batch closes, or a reorg discards
/// it.
#[derive(Clone, Debug)]
pub struct L2Block {
    /// Monotonic across the process lifetime; not the chain block number.
    pub tracking_num: u64,
    pub batch_number: u64,
    pub coinbase: Address,
    pub fork_id: u64,
    pub timestamp: u64,
    pub delta_timestamp: u32,
    pub l1_info_tree: L1InfoTreeUpdate,
    pub created_at: Instant,
    pub transactions: Vec<ProcessedTx>,
    pub metrics: BlockMetrics,
    /// Batch-level checkpoint the block started from.
    pub initial_state_root: B256,
    /// Root after the block's last successful tx; set when the block closes.
    pub final_state_root: B256,
    /// Filled by the pipeline process stage.
    pub block_number: u64,
    pub block_hash: B256,
    pub flush_id: u64,
    /// Stream framing: whether this block opens its batch, and the closing
    /// reason if it ends it.
    pub first_in_batch: bool,
    pub batch_end: Option<ClosingReason>,
    pub is_forced: bool,
}

impl L2Block {
    pub fn open(
        tracking_num: u64,
        batch: &Batch,
        timestamp: u64,
        delta_timestamp: u32,
        l1_info_tree: L1InfoTreeUpdate,
        first_in_batch: bool,
    ) -> Self {
        Self {
            tracking_num,
            batch_number: batch.batch_number,
            coinbase: batch.coinbase,
            fork_id: batch.fork_id,
            timestamp,
            delta_timestamp,
            l1_info_tree,
            created_at: Instant::now(),
            transactions: Vec::new(),
            metrics: BlockMetrics::default(),
            initial_state_root: batch.im_state_root,
            final_state_root: B256::ZERO,
            block_number: 0,
            block_hash: B256::ZERO,
            flush_id: 0,
            first_in_batch,
            batch_end: None,
            is_forced: batch.is_forced,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn add_tx(&mut self, tracker: TxTracker, response: TransactionResponse) {
        self.metrics.gas += response.gas_used;
        self.transactions.push(ProcessedTx { tracker, response });
    }

    /// Converts the closed block into its persisted form.
    pub fn to_stored(&self) -> StoredL2Block {
        StoredL2Block {
            batch_number: self.batch_number,
            header: L2BlockHeader {
                number: self.block_number,
                hash: self.block_hash,
                state_root: self.final_state_root,
                timestamp: self.timestamp,
            },
            delta_timestamp: self.delta_timestamp,
            l1_info_tree_index: self.l1_info_tree.index,
            global_exit_root: self.l1_info_tree.global_exit_root,
            flush_id: self.flush_id,
            transactions: self
                .transactions
                .iter()
                .map(|tx| StoredTransaction {
                    hash: tx.tracker.hash,
                    from: tx.tracker.from,
                    nonce: tx.tracker.nonce,
                    encoded: tx.tracker.raw_tx.clone(),
                    egp_percentage: tx.tracker.egp_percentage,
                    effective_gas_price: tx.tracker.effective_gas_price,
                    gas_used: tx.response.gas_used,
                    rom_error: tx.response.rom_error,
                    state_root: tx.response.state_root,
                })
                .collect(),
        }
    }

    /// The data-stream frames of this block, in emission order. Batches are
    /// framed by the first and last block that belong to them.
    pub fn stream_entries(&self) -> Vec<StreamEntry> {
        let mut entries = Vec::new();
        if self.first_in_batch {
            entries.push(StreamEntry::BookmarkBatch { batch_number: self.batch_number });
            entries.push(StreamEntry::BatchStart(StreamBatchStart {
                batch_number: self.batch_number,
                coinbase: self.coinbase,
                fork_id: self.fork_id,
                is_forced: self.is_forced,
            }));
        }
        entries.push(StreamEntry::BookmarkL2Block { l2_block_number: self.block_number });
        entries.push(StreamEntry::L2Block(StreamL2Block {
            batch_number: self.batch_number,
            l2_block_number: self.block_number,
            block_hash: self.block_hash,
            state_root: self.final_state_root,
            timestamp: self.timestamp,
            delta_timestamp: self.delta_timestamp,
            l1_info_tree_index: self.l1_info_tree.index,
            global_exit_root: self.l1_info_tree.global_exit_root,
        }));
        for tx in &self.transactions {
            entries.push(StreamEntry::Transaction(StreamTransaction {
                l2_block_number: self.block_number,
                hash: tx.tracker.hash,
                encoded: tx.tracker.raw_tx.clone(),
                effective_gas_price_percentage: tx.tracker.egp_percentage,
                is_valid: tx.response.rom_error.is_none(),
            }));
        }
        if self.batch_end.is_some() {
            entries.push(StreamEntry::BatchEnd(StreamBatchEnd {
                batch_number: self.batch_number,
                state_root: self.final_state_root,
                local_exit_root: B256::ZERO,
            }));
        }
        entries
    }
}
