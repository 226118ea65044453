use std::time::Duration;

use alloy_primitives::{Address, B256};
use tokio::time::Instant;
use zkevm_finalizer_types::resources::{BatchResources, ZkCounters};
use zkevm_finalizer_types::storage::{BatchStage, ClosingReason, PersistedBatch};

/// The work-in-progress batch owned by the finalize loop. Everything else
/// sees read-only snapshots.
#[derive(Clone, Debug)]
pub struct Batch {
    pub batch_number: u64,
    pub coinbase: Address,
    pub initial_state_root: B256,
    /// Intermediate state root: the newStateRoot returned by the last
    /// successful tx.
    pub im_state_root: B256,
    /// Set when the batch closes, from the intermediate root.
    pub final_state_root: B256,
    pub global_exit_root: B256,
    pub l1_info_tree_index: u32,
    pub timestamp: u64,
    pub fork_id: u64,
    pub count_of_txs: usize,
    pub count_of_l2_blocks: u64,
    pub initial_resources: BatchResources,
    pub remaining_resources: BatchResources,
    /// Elementwise maximum of the reserved-minus-used deltas observed across
    /// the batch's txs.
    pub high_reserved_zk_counters: ZkCounters,
    pub closing_reason: Option<ClosingReason>,
    pub stage: BatchStage,
    pub is_forced: bool,
    pub created_at: Instant,
}

impl Batch {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        batch_number: u64,
        coinbase: Address,
        state_root: B256,
        global_exit_root: B256,
        l1_info_tree_index: u32,
        timestamp: u64,
        fork_id: u64,
        resources: BatchResources,
        is_forced: bool,
    ) -> Self {
        Self {
            batch_number,
            coinbase,
            initial_state_root: state_root,
            im_state_root: state_root,
            final_state_root: B256::ZERO,
            global_exit_root,
            l1_info_tree_index,
            timestamp,
            fork_id,
            count_of_txs: 0,
            count_of_l2_blocks: 0,
            initial_resources: resources,
            remaining_resources: resources,
            high_reserved_zk_counters: ZkCounters::default(),
            closing_reason: None,
            stage: BatchStage::Open,
            is_forced,
            created_at: Instant::now(),
        }
    }

    /// Resumes an open batch from its persisted row after a restart.
    pub fn from_persisted(persisted: &PersistedBatch, full_resources: BatchResources) -> Self {
        Self {
            batch_number: persisted.batch_number,
            coinbase: persisted.coinbase,
            initial_state_root: persisted.initial_state_root,
            im_state_root: if persisted.final_state_root == B256::ZERO {
                persisted.initial_state_root
            } else {
                persisted.final_state_root
            },
            final_state_root: B256::ZERO,
            global_exit_root: persisted.global_exit_root,
            l1_info_tree_index: persisted.l1_info_tree_index,
            timestamp: persisted.timestamp,
            fork_id: persisted.fork_id,
            count_of_txs: persisted.count_of_txs,
            count_of_l2_blocks: persisted.count_of_l2_blocks,
            initial_resources: full_resources,
            remaining_resources: persisted.remaining_resources,
            high_reserved_zk_counters: persisted.high_reserved_zk_counters,
            closing_reason: None,
            stage: BatchStage::Open,
            is_forced: persisted.is_forced,
            created_at: Instant::now(),
        }
    }

    pub fn to_persisted(&self) -> PersistedBatch {
        PersistedBatch {
            batch_number: self.batch_number,
            coinbase: self.coinbase,
            initial_state_root: self.initial_state_root,
            final_state_root: self.final_state_root,
            global_exit_root: self.global_exit_root,
            l1_info_tree_index: self.l1_info_tree_index,
            timestamp: self.timestamp,
            fork_id: self.fork_id,
            count_of_txs: self.count_of_txs,
            count_of_l2_blocks: self.count_of_l2_blocks,
            remaining_resources: self.remaining_resources,
            high_reserved_zk_counters: self.high_reserved_zk_counters,
            closing_reason: self.closing_reason,
            stage: self.stage,
            is_forced: self.is_forced,
            l2_blocks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count_of_txs == 0
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Resources consumed so far, axis by axis.
    pub fn used_resources(&self) -> BatchResources {
        BatchResources {
            zk_counters: self
                .initial_resources
                .zk_counters
                .saturating_sub(&self.remaining_resources.zk_counters),
            bytes: self.initial_resources.bytes - self.remaining_resources.bytes,
        }
    }

    /// Whether any resource axis has dropped below `margin_pct` percent of
    /// its initial budget.
    pub fn resources_margin_exhausted(&self, margin_pct: u64) -> bool {
        let threshold = |initial: u64| initial.saturating_mul(margin_pct) / 100;
        if self.remaining_resources.bytes < threshold(self.initial_resources.bytes) {
            return true;
        }
        let remaining = &self.remaining_resources.zk_counters;
        let initial = &self.initial_resources.zk_counters;
        remaining.gas_used < threshold(initial.gas_used)
            || remaining.keccak_hashes < threshold(initial.keccak_hashes)
            || remaining.poseidon_hashes < threshold(initial.poseidon_hashes)
            || remaining.poseidon_paddings < threshold(initial.poseidon_paddings)
            || remaining.mem_aligns < threshold(initial.mem_aligns)
            || remaining.arithmetics < threshold(initial.arithmetics)
            || remaining.binaries < threshold(initial.binaries)
            || remaining.sha256_hashes < threshold(initial.sha256_hashes)
            || remaining.steps < threshold(initial.steps)
    }

    /// Marks the batch as closing. Once the reason is set the batch accepts
    /// no further mutation.
    pub fn start_closing(&mut self, reason: ClosingReason) {
        debug_assert!(self.closing_reason.is_none(), "closing reason set twice");
        self.closing_reason = Some(reason);
        self.stage = BatchStage::Closing;
    }

    /// Promotes the intermediate state root to the final one and seals the
    /// batch.
    pub fn seal(&mut self) {
        debug_assert!(self.closing_reason.is_some(), "sealing a batch with no closing reason");
        self.final_state_root = self.im_state_root;
        self.stage = BatchStage::Closed;
    }
}
