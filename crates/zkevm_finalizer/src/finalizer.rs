use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{Address, B256};
use metrics::counter;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zkevm_finalizer_config::{BatchConstraintsConfig, EffectiveGasPriceConfig, FinalizerConfig};
use zkevm_finalizer_types::communication::{
    BestTxOutcome,
    PoolTxStatus,
    ReadyTxsNotifier,
    SharedBaseLayerClient,
    SharedExecutorClient,
    SharedPoolClient,
    SharedStateClient,
    SharedStreamClient,
    SharedWorkerClient,
    StateClientResult,
};
use zkevm_finalizer_types::datastream::{StreamBatchEnd, StreamBatchStart, StreamEntry};
use zkevm_finalizer_types::executor::{ProcessRequest, MAX_EFFECTIVE_PERCENTAGE};
use zkevm_finalizer_types::forced_batch::ForcedBatch;
use zkevm_finalizer_types::l1_info_tree::L1InfoTreeUpdate;
use zkevm_finalizer_types::storage::{ClosingReason, PersistedBatch};
use zkevm_finalizer_types::tx::TxTracker;

use crate::batch::Batch;
use crate::effective_gas_price::EffectiveGasPrice;
use crate::flush_tracker::{FlushCursor, FlushIdTracker};
use crate::forced_batches::{ForcedBatchesHandle, ForcedBatchesWatcher};
use crate::l1_info_watcher::{L1InfoTreeHandle, L1InfoTreeWatcher};
use crate::l2_block::L2Block;
use crate::metrics::{
    increment_closed_batches,
    register_metrics,
    FAILED_TXS,
    FORCED_BATCHES_PROCESSED,
    HALT_COUNT,
    NODE_OOC_TXS,
    OVERFLOWED_TXS,
    REPROCESSED_TXS,
};
use crate::pipeline::{encode_change_l2_block, Pipeline, PipelineHandles};
use crate::tx_processor::{ProcessTxError, TxAttempt};

/// Why the finalizer stopped. Returned from [`Finalizer::run`]; the
/// supervisor decides whether to restart the process or keep it alive for
/// inspection.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum HaltReason {
    #[error("prover id changed from {old} to {new}, executor restarted")]
    ExecutorRestarted { old: String, new: String },
    #[error("executor returned no errors and no block responses for tx {tx_hash}")]
    ZeroBlockResponses { tx_hash: B256 },
    #[error("L2 block pipeline failure: {0}")]
    PipelineFailure(String),
    #[error("L2 block store failure: {0}")]
    StoreFailure(String),
    #[error("state root mismatch re-executing closed batch {batch_number}")]
    BatchCheckMismatch { batch_number: u64 },
    #[error("configured halt on batch number {0}")]
    HaltOnBatchNumber(u64),
    #[error("initialization failure: {0}")]
    InitFailure(String),
    #[error("canceled")]
    Canceled,
}

/// Records the first halt reason and exposes it to every task. The finalize
/// loop checks it each iteration and returns the reason as its terminal
/// state.
#[derive(Clone, Debug)]
pub struct HaltController {
    tx: Arc<watch::Sender<Option<HaltReason>>>,
}

impl Default for HaltController {
    fn default() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }
}

impl HaltController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a halt. Only the first reason is kept.
    pub fn halt(&self, reason: HaltReason, is_fatal: bool) {
        counter!(HALT_COUNT).increment(1);
        error!(event = "finalizer_halt", is_fatal, reason = %reason, "finalizer halted");
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn reason(&self) -> Option<HaltReason> {
        self.tx.borrow().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

/// The sequencing engine: a single cooperative loop owning the WIP batch and
/// WIP L2 block, surrounded by the pipeline stage workers and the flush-id,
/// L1-info-tree and forced-batch watchers.
pub struct Finalizer {
    pub(crate) cfg: FinalizerConfig,
    pub(crate) constraints: BatchConstraintsConfig,
    pub(crate) egp: EffectiveGasPrice,
    pub(crate) l2_coinbase: Address,

    pub(crate) executor: SharedExecutorClient,
    pub(crate) state: SharedStateClient,
    pub(crate) worker: SharedWorkerClient,
    pub(crate) pool: SharedPoolClient,
    pub(crate) base_layer: SharedBaseLayerClient,
    pub(crate) stream: SharedStreamClient,

    pub(crate) ready_txs: ReadyTxsNotifier,
    pub(crate) halt: HaltController,
    pub(crate) cancel: CancellationToken,

    pub(crate) l1_info_tree: L1InfoTreeHandle,
    pub(crate) forced_batches: ForcedBatchesHandle,
    pub(crate) l2_block_reorg: Arc<AtomicBool>,
    pub(crate) pending_flush: FlushCursor,
    pub(crate) stored_flush: FlushCursor,
    pub(crate) confirmed_root: watch::Sender<B256>,
    pub(crate) confirmed_root_rx: watch::Receiver<B256>,

    pub(crate) pipeline: Option<PipelineHandles>,

    pub(crate) wip_batch: Option<Batch>,
    pub(crate) wip_l2_block: Option<L2Block>,
    pub(crate) l2_block_counter: u64,
    pub(crate) last_block_timestamp: u64,
    pub(crate) fork_id: u64,
}

impl Finalizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: FinalizerConfig,
        constraints: BatchConstraintsConfig,
        egp_config: EffectiveGasPriceConfig,
        l2_coinbase: Address,
        executor: SharedExecutorClient,
        state: SharedStateClient,
        worker: SharedWorkerClient,
        pool: SharedPoolClient,
        base_layer: SharedBaseLayerClient,
        stream: SharedStreamClient,
        ready_txs: ReadyTxsNotifier,
        cancel: CancellationToken,
    ) -> Self {
        let (confirmed_root, confirmed_root_rx) = watch::channel(B256::ZERO);
        Self {
            cfg,
            constraints,
            egp: EffectiveGasPrice::new(egp_config),
            l2_coinbase,
            executor,
            state,
            worker,
            pool,
            base_layer,
            stream,
            ready_txs,
            halt: HaltController::new(),
            cancel,
            l1_info_tree: L1InfoTreeHandle::new(),
            forced_batches: ForcedBatchesHandle::new(0),
            l2_block_reorg: Arc::new(AtomicBool::new(false)),
            pending_flush: FlushCursor::default(),
            stored_flush: FlushCursor::default(),
            confirmed_root,
            confirmed_root_rx,
            pipeline: None,
            wip_batch: None,
            wip_l2_block: None,
            l2_block_counter: 0,
            last_block_timestamp: 0,
            fork_id: 0,
        }
    }

    pub(crate) fn wip_batch(&self) -> &Batch {
        self.wip_batch.as_ref().expect("WIP batch is initialized before the loop starts")
    }

    pub(crate) fn wip_batch_mut(&mut self) -> &mut Batch {
        self.wip_batch.as_mut().expect("WIP batch is initialized before the loop starts")
    }

    pub(crate) fn wip_l2_block(&self) -> &L2Block {
        self.wip_l2_block.as_ref().expect("WIP L2 block is initialized before the loop starts")
    }

    pub(crate) fn wip_l2_block_mut(&mut self) -> &mut L2Block {
        self.wip_l2_block.as_mut().expect("WIP L2 block is initialized before the loop starts")
    }

    fn pipeline(&self) -> &PipelineHandles {
        self.pipeline.as_ref().expect("pipeline is spawned before the loop starts")
    }

    /// Starts the finalizer: sanity-checks batches pending verification,
    /// spawns the watchers and the pipeline, initializes the WIP batch and
    /// L2 block, then runs the finalize loop to its terminal state.
    pub async fn run(mut self) -> HaltReason {
        register_metrics();
        info!(coinbase = %self.l2_coinbase, "starting finalizer");

        if let Err(reason) = self.process_batches_pending_to_check().await {
            self.halt.halt(reason.clone(), true);
            return reason;
        }

        tokio::spawn(
            L1InfoTreeWatcher::new(
                self.state.clone(),
                self.base_layer.clone(),
                self.cfg.l1_info_tree_check_interval(),
                self.cfg.l1_info_tree_l1_block_confirmations,
                self.l1_info_tree.clone(),
                self.cancel.clone(),
            )
            .run(),
        );

        if let Err(reason) = self.init_wip_batch().await {
            return reason;
        }
        self.init_wip_l2_block().await;

        tokio::spawn(
            FlushIdTracker::new(
                self.executor.clone(),
                self.pending_flush.clone(),
                self.stored_flush.clone(),
                self.cfg.flush_id_check_interval(),
                self.halt.clone(),
                self.cancel.clone(),
            )
            .run(),
        );

        self.pipeline = Some(
            Pipeline {
                executor: self.executor.clone(),
                state: self.state.clone(),
                pool: self.pool.clone(),
                stream: self.stream.clone(),
                pending_flush: self.pending_flush.clone(),
                stored_flush: self.stored_flush.clone(),
                l2_block_reorg: self.l2_block_reorg.clone(),
                confirmed_root: self.confirmed_root.clone(),
                halt: self.halt.clone(),
                cancel: self.cancel.clone(),
                buffer_size: self.cfg.pending_l2_blocks_buffer_size,
            }
            .spawn(),
        );

        tokio::spawn(
            ForcedBatchesWatcher::new(
                self.state.clone(),
                self.base_layer.clone(),
                self.forced_batches.clone(),
                self.cfg.forced_batches_check_interval(),
                self.cfg.forced_batches_timeout(),
                self.cfg.l1_info_tree_l1_block_confirmations,
                self.cancel.clone(),
            )
            .run(),
        );

        self.finalize_batches().await
    }

    /// The endless loop processing transactions and finalizing batches.
    pub(crate) async fn finalize_batches(&mut self) -> HaltReason {
        debug!("finalizer init loop");
        let mut show_not_found_tx_log = true;

        loop {
            if self.l2_block_reorg.load(Ordering::Acquire) {
                self.process_l2_block_reorg().await;
            }

            // L2 block period reached: close the WIP block and open a new one.
            if self.wip_l2_block().age() >= self.cfg.l2_block_max_delta_timestamp() {
                self.finalize_wip_l2_block(None).await;
                self.open_wip_l2_block();
            }

            let is_batch_empty = self.wip_batch().count_of_l2_blocks == 0
                && self.wip_l2_block().is_empty();
            let best = self
                .worker
                .get_best_fitting_tx(
                    self.wip_batch().remaining_resources,
                    self.wip_batch().high_reserved_zk_counters,
                    is_batch_empty,
                )
                .await;

            // Transactions that will never fit an empty batch are invalid for
            // good: drop them from the worker and flag them in the pool.
            for ooc_tx in &best.node_ooc_txs {
                info!(
                    event = "node_ooc",
                    tx = %ooc_tx.hash,
                    from = %ooc_tx.from,
                    batch_number = self.wip_batch().batch_number,
                    "tx doesn't fit in an empty batch (node OOC), setting tx as invalid in the pool"
                );
                counter!(NODE_OOC_TXS).increment(1);
                self.worker.delete_tx(ooc_tx.hash, ooc_tx.from).await;
                if let Err(err) = self
                    .pool
                    .update_tx_status(
                        ooc_tx.hash,
                        PoolTxStatus::Invalid,
                        false,
                        Some("node OOC".to_string()),
                    )
                    .await
                {
                    error!(tx = %ooc_tx.hash, error = %err, "failed to update tx status to invalid in the pool");
                }
            }

            match best.outcome {
                BestTxOutcome::NoFittingTx => {
                    // Pending txs exist but none fits the WIP batch.
                    self.finalize_wip_batch(ClosingReason::NoTxFits).await;
                    continue;
                }
                BestTxOutcome::Found(mut tx) => {
                    self.try_to_sleep().await;
                    show_not_found_tx_log = true;
                    debug!(tx = %tx.hash, "processing tx");

                    let mut attempt = TxAttempt::First;
                    loop {
                        match self.process_transaction(&mut tx, attempt).await {
                            Ok(()) => break,
                            Err(ProcessTxError::EffectiveGasPriceReprocess) => {
                                info!(tx = %tx.hash, "reprocessing tx because of effective gas price calculation");
                                counter!(REPROCESSED_TXS).increment(1);
                                attempt = TxAttempt::Reprocess;
                            }
                            Err(ProcessTxError::BatchResourceOverflow(overflow)) => {
                                info!(tx = %tx.hash, resource = overflow.resource, "skipping tx due to a batch resource overflow");
                                counter!(OVERFLOWED_TXS).increment(1);
                                break;
                            }
                            Err(err) => {
                                error!(tx = %tx.hash, error = %err, "failed to process tx");
                                counter!(FAILED_TXS).increment(1);
                                break;
                            }
                        }
                    }
                }
                BestTxOutcome::NoTxAvailable => {
                    self.try_to_sleep().await;
                    if show_not_found_tx_log {
                        debug!("no transactions to be processed. Waiting...");
                        show_not_found_tx_log = false;
                    }

                    let idle_start = Instant::now();
                    self.ready_txs.wait_timeout(self.cfg.new_txs_wait_interval()).await;
                    self.wip_l2_block_mut().metrics.idle_time += idle_start.elapsed();
                }
            }

            if let Some(reason) = self.halt.reason() {
                return reason;
            }

            if let Some(reason) = self.check_if_finalize_batch() {
                self.finalize_wip_batch(reason).await;
            }

            if self.cancel.is_cancelled() {
                info!("stopping finalizer: cancellation requested");
                // Stage workers finish their current unit and exit; give the
                // pipeline a bounded grace period to drain.
                let _ = tokio::time::timeout(
                    std::time::Duration::from_secs(5),
                    self.pipeline().wait_all_idle(),
                )
                .await;
                return HaltReason::Canceled;
            }
        }
    }

    /// Loop throttle read from configuration.
    async fn try_to_sleep(&self) {
        if let Some(duration) = self.cfg.sequencer_sleep_duration() {
            tokio::time::sleep(duration).await;
        }
    }

    /// Evaluates every batch closing condition.
    pub(crate) fn check_if_finalize_batch(&self) -> Option<ClosingReason> {
        let batch = self.wip_batch();
        if batch.resources_margin_exhausted(self.cfg.resource_percentage_to_close_batch) {
            return Some(ClosingReason::BatchFull);
        }
        if batch.count_of_txs >= self.constraints.max_txs_per_batch {
            return Some(ClosingReason::MaxTxs);
        }
        if batch.age() >= self.cfg.batch_max_delta_timestamp() {
            return Some(ClosingReason::TimestampResolutionExceeded);
        }
        if self.forced_batches.deadline_reached(unix_now_secs()) {
            return Some(ClosingReason::ForcedBatchDeadline);
        }
        if let Some(update) = self.l1_info_tree.latest() {
            if self.l1_info_tree.is_valid() && update.index > batch.l1_info_tree_index {
                return Some(ClosingReason::L1InfoTreeIndexChanged);
            }
        }
        None
    }

    /// Closes the WIP L2 block and hands it to the pipeline. `batch_end`
    /// carries the closing reason when this block seals its batch.
    pub(crate) async fn finalize_wip_l2_block(&mut self, batch_end: Option<ClosingReason>) {
        let mut block = self.wip_l2_block.take().expect("WIP L2 block is initialized");
        let batch = self.wip_batch_mut();
        block.final_state_root = batch.im_state_root;
        block.batch_end = batch_end;
        batch.count_of_l2_blocks += 1;
        self.last_block_timestamp = block.timestamp;

        debug!(
            tracking_num = block.tracking_num,
            batch_number = block.batch_number,
            txs = block.transactions.len(),
            "finalizing WIP L2 block"
        );
        if self.pipeline().submit(block).await.is_err() {
            warn!("pipeline closed, dropping finalized L2 block");
        }
    }

    pub(crate) fn open_wip_l2_block(&mut self) {
        let now = unix_now_secs().max(self.last_block_timestamp);
        let delta = u32::try_from(now - self.last_block_timestamp).unwrap_or(u32::MAX);
        let l1_info = self.l1_info_tree.latest().unwrap_or_default();
        self.l2_block_counter += 1;
        let batch = self.wip_batch.as_ref().expect("WIP batch is initialized");
        let first_in_batch = batch.count_of_l2_blocks == 0;
        self.wip_l2_block = Some(L2Block::open(
            self.l2_block_counter,
            batch,
            now,
            delta,
            l1_info,
            first_in_batch,
        ));
    }

    /// Closes the WIP batch with the given reason, sequences any overdue
    /// forced batches, and opens the next batch and block.
    pub(crate) async fn finalize_wip_batch(&mut self, reason: ClosingReason) {
        self.wip_batch_mut().start_closing(reason);
        self.finalize_wip_l2_block(Some(reason)).await;

        let batch = self.wip_batch_mut();
        batch.seal();
        info!(
            batch_number = batch.batch_number,
            reason = %reason,
            txs = batch.count_of_txs,
            l2_blocks = batch.count_of_l2_blocks,
            "WIP batch closed"
        );
        increment_closed_batches(reason);

        let mut next_number = self.wip_batch().batch_number + 1;
        let mut state_root = self.wip_batch().final_state_root;

        if reason == ClosingReason::ForcedBatchDeadline {
            for forced in self.forced_batches.take_all() {
                match self.sequence_forced_batch(next_number, state_root, forced).await {
                    Ok(new_root) => {
                        state_root = new_root;
                        next_number += 1;
                    }
                    Err(err) => {
                        error!(error = %err, "failed to sequence forced batch");
                    }
                }
            }
        }

        self.open_wip_batch(next_number, state_root).await;
        self.open_wip_l2_block();
    }

    async fn open_wip_batch(&mut self, batch_number: u64, state_root: B256) {
        if self.cfg.halt_on_batch_number != 0 && self.cfg.halt_on_batch_number == batch_number {
            self.halt.halt(HaltReason::HaltOnBatchNumber(batch_number), false);
        }

        match self.state.get_fork_id_by_batch_number(batch_number).await {
            Ok(fork_id) => self.fork_id = fork_id,
            Err(err) => error!(error = %err, "failed to get fork id, keeping the previous one"),
        }

        let l1_info = self.l1_info_tree.latest().unwrap_or_default();
        let batch = Batch::open(
            batch_number,
            self.l2_coinbase,
            state_root,
            l1_info.global_exit_root,
            l1_info.index,
            unix_now_secs(),
            self.fork_id,
            self.constraints.batch_resources(),
            false,
        );
        let _ = self.confirmed_root.send(state_root);

        if let Err(err) = self.persist_open_batch(&batch.to_persisted()).await {
            error!(batch_number, error = %err, "failed to persist the open batch");
        }
        info!(batch_number, state_root = %state_root, "new WIP batch opened");
        self.wip_batch = Some(batch);
    }

    async fn persist_open_batch(&self, batch: &PersistedBatch) -> StateClientResult<()> {
        let mut state_tx = self.state.begin_state_transaction().await?;
        let opened = state_tx.open_batch(batch.clone()).await;
        match opened {
            Ok(()) => state_tx.commit().await,
            Err(err) => {
                if let Err(rollback_err) = state_tx.rollback().await {
                    error!(error = %rollback_err, "rollback failed after open batch error");
                }
                Err(err)
            }
        }
    }

    /// Resumes the last open batch or opens the next one.
    pub(crate) async fn init_wip_batch(&mut self) -> Result<(), HaltReason> {
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(HaltReason::Canceled),
            _ = self.l1_info_tree.wait_valid() => {}
        }

        let last_batch = self
            .state
            .get_last_batch()
            .await
            .map_err(|err| HaltReason::InitFailure(err.to_string()))?;

        match last_batch {
            Some(batch) if batch.closing_reason.is_none() => {
                info!(batch_number = batch.batch_number, "resuming WIP batch");
                self.fork_id = batch.fork_id;
                let resumed = Batch::from_persisted(&batch, self.constraints.batch_resources());
                let _ = self.confirmed_root.send(resumed.im_state_root);
                self.wip_batch = Some(resumed);
            }
            Some(batch) => {
                self.open_wip_batch(batch.batch_number + 1, batch.final_state_root).await;
            }
            None => {
                let root = self
                    .state
                    .get_last_state_root()
                    .await
                    .map_err(|err| HaltReason::InitFailure(err.to_string()))?;
                self.open_wip_batch(1, root).await;
            }
        }
        Ok(())
    }

    pub(crate) async fn init_wip_l2_block(&mut self) {
        match self.state.get_last_l2_block_header().await {
            Ok(Some(header)) => {
                self.last_block_timestamp = header.timestamp;
            }
            Ok(None) => {}
            Err(err) => {
                error!(error = %err, "failed to get the last L2 block header");
            }
        }
        self.open_wip_l2_block();
    }

    /// The executor rejected a speculatively built block: discard the WIP
    /// block, rewind the intermediate state root to the last confirmed
    /// checkpoint and drain the process/store queues.
    async fn process_l2_block_reorg(&mut self) {
        self.pipeline().wait_process_and_store_idle().await;
        self.l2_block_reorg.store(false, Ordering::Release);

        let checkpoint = *self.confirmed_root_rx.borrow();
        let discarded =
            self.wip_l2_block.take().map(|block| block.transactions.len()).unwrap_or_default();
        let batch = self.wip_batch_mut();
        warn!(
            batch_number = batch.batch_number,
            discarded_txs = discarded,
            checkpoint = %checkpoint,
            "L2 block reorg: discarding WIP block and rewinding the intermediate state root"
        );
        batch.im_state_root = checkpoint;
        self.open_wip_l2_block();
    }

    /// Sequences one forced batch: executes its raw txs as a whole batch,
    /// persists and streams the result, and deletes the forced txs from the
    /// worker.
    async fn sequence_forced_batch(
        &mut self,
        batch_number: u64,
        old_state_root: B256,
        forced: ForcedBatch,
    ) -> Result<B256, HaltReason> {
        // Serialize against the pipeline so stream entries stay in commit
        // order.
        self.pipeline().wait_all_idle().await;

        info!(
            batch_number,
            forced_batch_number = forced.forced_batch_number,
            "sequencing forced batch"
        );

        let request = ProcessRequest {
            batch_number,
            old_state_root,
            coinbase: self.l2_coinbase,
            fork_id: self.fork_id,
            timestamp_limit: unix_now_secs(),
            l1_info_root: forced.global_exit_root,
            transactions: forced.raw_txs.clone(),
            skip_first_change_l2_block: false,
            skip_write_block_info_root: false,
            skip_verify_l1_info_root: true,
            l1_info_tree_data: Default::default(),
        };
        let response = self
            .executor
            .process_batch(request, true)
            .await
            .map_err(|err| HaltReason::PipelineFailure(err.to_string()))?;
        self.pending_flush.advance(response.flush_id);

        let mut batch = Batch::open(
            batch_number,
            self.l2_coinbase,
            old_state_root,
            forced.global_exit_root,
            0,
            unix_now_secs(),
            self.fork_id,
            self.constraints.batch_resources(),
            true,
        );
        batch.im_state_root = response.new_state_root;

        // Build the blocks from the executor responses; forced txs carry no
        // tracker of their own.
        let mut blocks = Vec::new();
        let mut stream_entries = vec![
            StreamEntry::BookmarkBatch { batch_number },
            StreamEntry::BatchStart(StreamBatchStart {
                batch_number,
                coinbase: self.l2_coinbase,
                fork_id: self.fork_id,
                is_forced: true,
            }),
        ];
        for (position, block_response) in response.block_responses.iter().enumerate() {
            self.l2_block_counter += 1;
            let mut block = L2Block::open(
                self.l2_block_counter,
                &batch,
                block_response.timestamp,
                0,
                L1InfoTreeUpdate {
                    global_exit_root: forced.global_exit_root,
                    ..Default::default()
                },
                position == 0,
            );
            for tx_response in &block_response.transaction_responses {
                batch.count_of_txs += 1;
                let tracker = TxTracker {
                    hash: tx_response.tx_hash,
                    from: tx_response.from,
                    egp_percentage: MAX_EFFECTIVE_PERCENTAGE,
                    ..Default::default()
                };
                block.add_tx(tracker, tx_response.clone());
                self.worker.delete_forced_tx(tx_response.tx_hash, tx_response.from).await;
            }
            block.block_number = block_response.block_number;
            block.block_hash = block_response.block_hash;
            block.flush_id = response.flush_id;
            block.final_state_root = if position == response.block_responses.len() - 1 {
                response.new_state_root
            } else {
                block_response
                    .transaction_responses
                    .last()
                    .map(|tx| tx.state_root)
                    .unwrap_or(response.new_state_root)
            };
            batch.count_of_l2_blocks += 1;

            stream_entries.push(StreamEntry::BookmarkL2Block {
                l2_block_number: block.block_number,
            });
            let mut entries = block.stream_entries();
            // The batch framing of this forced batch is emitted here, not per
            // block.
            entries.retain(|entry| {
                matches!(entry, StreamEntry::L2Block(_) | StreamEntry::Transaction(_))
            });
            stream_entries.extend(entries);
            blocks.push(block);
        }
        stream_entries.push(StreamEntry::BatchEnd(StreamBatchEnd {
            batch_number,
            state_root: response.new_state_root,
            local_exit_root: B256::ZERO,
        }));

        batch.start_closing(ClosingReason::ForcedBatchDeadline);
        batch.seal();

        self.persist_forced_batch(&batch, &blocks)
            .await
            .map_err(|err| HaltReason::StoreFailure(err.to_string()))?;

        if let Err(err) = self.stream.write_entries(stream_entries).await {
            error!(batch_number, error = %err, "failed to stream forced batch");
        }

        counter!(FORCED_BATCHES_PROCESSED).increment(1);
        Ok(response.new_state_root)
    }

    async fn persist_forced_batch(
        &self,
        batch: &Batch,
        blocks: &[L2Block],
    ) -> StateClientResult<()> {
        let mut state_tx = self.state.begin_state_transaction().await?;
        let write = async {
            state_tx.open_batch(batch.to_persisted()).await?;
            for block in blocks {
                state_tx.store_l2_block(block.to_stored()).await?;
            }
            state_tx
                .close_batch(
                    batch.batch_number,
                    batch.final_state_root,
                    ClosingReason::ForcedBatchDeadline,
                )
                .await
        };
        let written: StateClientResult<()> = write.await;
        match written {
            Ok(()) => state_tx.commit().await,
            Err(err) => {
                if let Err(rollback_err) = state_tx.rollback().await {
                    error!(error = %rollback_err, "rollback failed after forced batch store error");
                }
                Err(err)
            }
        }
    }

    /// Re-executes closed-but-unchecked batches in non-persistent mode and
    /// confirms the stored final state root matches what the executor will
    /// regenerate during proving.
    pub(crate) async fn process_batches_pending_to_check(&self) -> Result<(), HaltReason> {
        let batches = self
            .state
            .get_batches_pending_check()
            .await
            .map_err(|err| HaltReason::InitFailure(err.to_string()))?;

        for batch in batches {
            let mut transactions = Vec::new();
            let mut l1_info_tree_data = std::collections::BTreeMap::new();
            for block in &batch.l2_blocks {
                transactions
                    .extend(encode_change_l2_block(block.delta_timestamp, block.l1_info_tree_index));
                for tx in &block.transactions {
                    transactions.extend_from_slice(&tx.encoded);
                    transactions.push(tx.egp_percentage);
                }
                l1_info_tree_data.insert(
                    block.l1_info_tree_index,
                    zkevm_finalizer_types::executor::L1InfoTreeLeaf {
                        global_exit_root: block.global_exit_root,
                        block_hash: B256::ZERO,
                        min_timestamp: block.header.timestamp,
                    },
                );
            }

            let request = ProcessRequest {
                batch_number: batch.batch_number,
                old_state_root: batch.initial_state_root,
                coinbase: batch.coinbase,
                fork_id: batch.fork_id,
                timestamp_limit: batch.timestamp,
                l1_info_root: B256::ZERO,
                transactions: transactions.into(),
                skip_first_change_l2_block: false,
                skip_write_block_info_root: false,
                skip_verify_l1_info_root: true,
                l1_info_tree_data,
            };

            let response = self
                .executor
                .process_batch(request, false)
                .await
                .map_err(|err| HaltReason::InitFailure(err.to_string()))?;

            if response.new_state_root != batch.final_state_root {
                error!(
                    batch_number = batch.batch_number,
                    stored_root = %batch.final_state_root,
                    replayed_root = %response.new_state_root,
                    "closed batch failed the re-execution sanity check"
                );
                return Err(HaltReason::BatchCheckMismatch { batch_number: batch.batch_number });
            }

            info!(batch_number = batch.batch_number, "closed batch re-execution checked");
            if let Err(err) = self.state.mark_batch_checked(batch.batch_number).await {
                error!(batch_number = batch.batch_number, error = %err, "failed to mark batch as checked");
            }
        }
        Ok(())
    }
}
