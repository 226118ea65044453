use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::B256;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zkevm_finalizer_types::communication::{
    BaseLayerClientResult,
    SharedBaseLayerClient,
    SharedStateClient,
};
use zkevm_finalizer_types::l1_info_tree::L1InfoTreeUpdate;

/// Shared snapshot of the latest valid L1 info tree leaf. The finalize loop
/// reads it when opening blocks and batches; the watcher writes it.
#[derive(Clone, Debug, Default)]
pub struct L1InfoTreeHandle {
    inner: Arc<L1InfoTreeShared>,
}

#[derive(Debug, Default)]
struct L1InfoTreeShared {
    latest: Mutex<Option<L1InfoTreeUpdate>>,
    valid: AtomicBool,
    valid_notify: Notify,
}

impl L1InfoTreeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<L1InfoTreeUpdate> {
        self.inner.latest.lock().expect("l1 info tree lock poisoned").clone()
    }

    pub fn set_latest(&self, update: L1InfoTreeUpdate) {
        *self.inner.latest.lock().expect("l1 info tree lock poisoned") = Some(update);
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// Marks the last update valid and wakes every task waiting on it.
    pub fn mark_valid(&self) {
        self.inner.valid.store(true, Ordering::Release);
        self.inner.valid_notify.notify_waiters();
    }

    /// Waits until a first valid update has been observed.
    pub async fn wait_valid(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.valid_notify.notified());
            notified.as_mut().enable();
            if self.is_valid() {
                return;
            }
            notified.await;
        }
    }
}

/// Periodic task validating the latest l1InfoRoot the synchronizer mirrored
/// into the state. On a reorg or an index/GER mismatch against the canonical
/// chain the watcher stops advancing the index; the finalizer keeps producing
/// batches pinned to the last valid one.
pub struct L1InfoTreeWatcher {
    state: SharedStateClient,
    base_layer: SharedBaseLayerClient,
    check_interval: Duration,
    block_confirmations: u64,
    handle: L1InfoTreeHandle,
    cancel: CancellationToken,
}

impl L1InfoTreeWatcher {
    pub fn new(
        state: SharedStateClient,
        base_layer: SharedBaseLayerClient,
        check_interval: Duration,
        block_confirmations: u64,
        handle: L1InfoTreeHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self { state, base_layer, check_interval, block_confirmations, handle, cancel }
    }

    pub async fn run(self) {
        // A zero interval disables validation entirely.
        if self.check_interval.is_zero() {
            self.handle.mark_valid();
            return;
        }

        let mut skip_first_sleep = true;
        let mut first_update = true;

        loop {
            if skip_first_sleep {
                skip_first_sleep = false;
            } else {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.check_interval) => {}
                }
            }

            let last_l1_block = match self.base_layer.get_latest_block_number().await {
                Ok(number) => number,
                Err(err) => {
                    error!(error = %err, "error getting latest L1 block number");
                    continue;
                }
            };
            let max_block_number = last_l1_block.saturating_sub(self.block_confirmations);

            let mut candidate = match self.state.get_latest_l1_info_root(max_block_number).await {
                Ok(Some(update)) => update,
                Ok(None) => continue,
                Err(err) => {
                    error!(error = %err, "error getting latest l1InfoRoot");
                    continue;
                }
            };

            // Index 0 is the empty-tree sentinel; its GER is forced to zero.
            if candidate.is_empty_tree_sentinel() {
                candidate.global_exit_root = B256::ZERO;
            }

            let current_index = self.handle.latest().map(|update| update.index);
            if !first_update && Some(candidate.index) <= current_index {
                continue;
            }

            info!(
                root = %candidate.root,
                index = candidate.index,
                l1_block = candidate.block_number,
                "received new l1InfoRoot"
            );

            if !candidate.is_empty_tree_sentinel() {
                match self.check_valid_l1_info_root(&candidate).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            root = %candidate.root,
                            index = candidate.index,
                            l1_block = candidate.block_number,
                            "invalid l1InfoRoot, stopping l1InfoTreeIndex syncing"
                        );
                        return;
                    }
                    Err(err) => {
                        error!(index = candidate.index, error = %err, "error validating l1InfoRoot");
                        continue;
                    }
                }
            }

            first_update = false;
            self.handle.set_latest(candidate);
            self.handle.mark_valid();
        }
    }

    /// Validates a candidate leaf against the canonical chain: the locally
    /// stored L1 block hash must match ethereum (reorg detection), and the
    /// GER/index reconstructed from the rollup events and the deposit count
    /// at that block must equal the candidate's.
    async fn check_valid_l1_info_root(
        &self,
        candidate: &L1InfoTreeUpdate,
    ) -> BaseLayerClientResult<bool> {
        let local_block = match self.state.get_l1_block_by_number(candidate.block_number).await {
            Ok(Some(block)) => block,
            Ok(None) => {
                error!(l1_block = candidate.block_number, "L1 block not found in the state");
                return Ok(false);
            }
            Err(err) => {
                error!(l1_block = candidate.block_number, error = %err, "error reading L1 block");
                return Ok(false);
            }
        };

        let canonical_header = self.base_layer.header_by_number(candidate.block_number).await?;
        if local_block.hash != canonical_header.hash {
            warn!(
                event = "invalid_info_root",
                root = %candidate.root,
                index = candidate.index,
                l1_block = candidate.block_number,
                local_hash = %local_block.hash,
                canonical_hash = %canonical_header.hash,
                "L1 block hash doesn't match the canonical chain (L1 reorg?)"
            );
            return Ok(false);
        }

        // Several l1InfoTree events may land in the same block; the candidate
        // is always the last one, so compare against the last event's GER.
        debug!(l1_block = candidate.block_number, "getting l1InfoRoot events");
        let events = self
            .base_layer
            .get_l1_info_tree_events(candidate.block_number, candidate.block_number)
            .await?;
        let last_ger = events.last().map(|event| event.global_exit_root).unwrap_or(B256::ZERO);

        let deposit_count = self.base_layer.deposit_count(Some(candidate.block_number)).await?;
        let deposit_count = u64::try_from(deposit_count).unwrap_or(u64::MAX);
        if deposit_count == 0 {
            warn!(
                event = "invalid_info_root",
                root = %candidate.root,
                index = candidate.index,
                l1_block = candidate.block_number,
                "deposit count returned by the contract is 0, impossible in this context"
            );
            return Ok(false);
        }
        // The tree index starts at 0, so the last index at that block is the
        // deposit count minus one.
        let index = u32::try_from(deposit_count - 1).unwrap_or(u32::MAX);

        if candidate.global_exit_root != last_ger || candidate.index != index {
            warn!(
                event = "invalid_info_root",
                root = %candidate.root,
                index = candidate.index,
                ger = %candidate.global_exit_root,
                contract_index = index,
                contract_ger = %last_ger,
                "l1InfoRoot doesn't match the contract state"
            );
            return Ok(false);
        }

        Ok(true)
    }
}
