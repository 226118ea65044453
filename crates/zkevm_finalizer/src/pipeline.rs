use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use alloy_primitives::B256;
use metrics::gauge;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zkevm_finalizer_types::communication::{
    PoolTxStatus,
    SharedExecutorClient,
    SharedPoolClient,
    SharedStateClient,
    SharedStreamClient,
    StateClientResult,
};
use zkevm_finalizer_types::executor::{L1InfoTreeLeaf, ProcessRequest};

use crate::finalizer::{HaltController, HaltReason};
use crate::flush_tracker::FlushCursor;
use crate::l2_block::L2Block;
use crate::metrics::DATA_TO_STREAM_BACKLOG;

/// Tx type marker of a changeL2Block transaction.
const CHANGE_L2_BLOCK_TX_TYPE: u8 = 0x0b;

/// Encodes a changeL2Block marker: type byte + big-endian deltaTimestamp +
/// big-endian l1InfoTreeIndex.
pub(crate) fn encode_change_l2_block(delta_timestamp: u32, l1_info_tree_index: u32) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(9);
    encoded.push(CHANGE_L2_BLOCK_TX_TYPE);
    encoded.extend_from_slice(&delta_timestamp.to_be_bytes());
    encoded.extend_from_slice(&l1_info_tree_index.to_be_bytes());
    encoded
}

/// Counts the units of work inside a pipeline stage so shutdown and the
/// reorg path can wait for the stage to drain.
#[derive(Clone, Debug, Default)]
pub struct InFlight {
    inner: Arc<InFlightInner>,
}

#[derive(Debug, Default)]
struct InFlightInner {
    count: AtomicUsize,
    notify: Notify,
}

impl InFlight {
    pub fn add(&self, n: usize) {
        self.inner.count.fetch_add(n, Ordering::AcqRel);
    }

    pub fn done(&self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    pub async fn wait_idle(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Handles held by the finalize loop over the running pipeline.
#[derive(Clone)]
pub struct PipelineHandles {
    to_process: mpsc::Sender<L2Block>,
    pub process_in_flight: InFlight,
    pub store_in_flight: InFlight,
    pub stream_in_flight: InFlight,
}

impl PipelineHandles {
    /// Hands a closed block to the process stage. This is the only point
    /// where the finalize loop blocks on pipeline saturation.
    pub async fn submit(&self, block: L2Block) -> Result<(), mpsc::error::SendError<L2Block>> {
        self.process_in_flight.add(1);
        let result = self.to_process.send(block).await;
        if result.is_err() {
            self.process_in_flight.done();
        }
        result
    }

    /// Waits for the process and store stages to drain.
    pub async fn wait_process_and_store_idle(&self) {
        self.process_in_flight.wait_idle().await;
        self.store_in_flight.wait_idle().await;
    }

    pub async fn wait_all_idle(&self) {
        self.wait_process_and_store_idle().await;
        self.stream_in_flight.wait_idle().await;
    }
}

/// The L2-block pipeline: three bounded FIFO stages with one cooperative
/// worker each. The process stage assembles the closed block through the
/// executor, the store stage persists it once its flush id is durable, the
/// stream stage emits its datastream frames.
pub struct Pipeline {
    pub executor: SharedExecutorClient,
    pub state: SharedStateClient,
    pub pool: SharedPoolClient,
    pub stream: SharedStreamClient,
    pub pending_flush: FlushCursor,
    pub stored_flush: FlushCursor,
    pub l2_block_reorg: Arc<AtomicBool>,
    pub confirmed_root: watch::Sender<B256>,
    pub halt: HaltController,
    pub cancel: CancellationToken,
    pub buffer_size: usize,
}

impl Pipeline {
    pub fn spawn(self) -> PipelineHandles {
        let (to_process, process_rx) = mpsc::channel(self.buffer_size);
        let (to_store, store_rx) = mpsc::channel(self.buffer_size);
        let (to_stream, stream_rx) = mpsc::channel(self.buffer_size);

        let handles = PipelineHandles {
            to_process,
            process_in_flight: InFlight::default(),
            store_in_flight: InFlight::default(),
            stream_in_flight: InFlight::default(),
        };

        let data_to_stream_count = Arc::new(AtomicI64::new(0));

        tokio::spawn(process_worker(
            process_rx,
            to_store,
            self.executor,
            self.pending_flush,
            self.l2_block_reorg,
            self.confirmed_root,
            handles.process_in_flight.clone(),
            handles.store_in_flight.clone(),
            self.halt.clone(),
            self.cancel.clone(),
        ));
        tokio::spawn(store_worker(
            store_rx,
            to_stream,
            self.state,
            self.pool,
            self.stored_flush,
            data_to_stream_count.clone(),
            handles.store_in_flight.clone(),
            handles.stream_in_flight.clone(),
            self.halt,
            self.cancel.clone(),
        ));
        tokio::spawn(stream_worker(
            stream_rx,
            self.stream,
            data_to_stream_count,
            handles.stream_in_flight.clone(),
            self.cancel,
        ));

        handles
    }
}

/// Builds the block-assembly executor request for a closed block: the
/// changeL2Block marker followed by every tx with its effective percentage
/// suffix.
fn build_block_request(block: &L2Block) -> ProcessRequest {
    let mut transactions =
        encode_change_l2_block(block.delta_timestamp, block.l1_info_tree.index);
    for tx in &block.transactions {
        transactions.extend_from_slice(&tx.tracker.raw_tx);
        transactions.push(tx.tracker.egp_percentage);
    }

    let mut l1_info_tree_data = std::collections::BTreeMap::new();
    l1_info_tree_data.insert(
        block.l1_info_tree.index,
        L1InfoTreeLeaf {
            global_exit_root: block.l1_info_tree.global_exit_root,
            block_hash: B256::ZERO,
            min_timestamp: block.l1_info_tree.min_timestamp,
        },
    );

    ProcessRequest {
        batch_number: block.batch_number,
        old_state_root: block.initial_state_root,
        coinbase: block.coinbase,
        fork_id: block.fork_id,
        timestamp_limit: block.timestamp,
        l1_info_root: block.l1_info_tree.root,
        transactions: transactions.into(),
        skip_first_change_l2_block: false,
        skip_write_block_info_root: false,
        skip_verify_l1_info_root: true,
        l1_info_tree_data,
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_worker(
    mut rx: mpsc::Receiver<L2Block>,
    to_store: mpsc::Sender<L2Block>,
    executor: SharedExecutorClient,
    pending_flush: FlushCursor,
    l2_block_reorg: Arc<AtomicBool>,
    confirmed_root: watch::Sender<B256>,
    process_in_flight: InFlight,
    store_in_flight: InFlight,
    halt: HaltController,
    cancel: CancellationToken,
) {
    loop {
        let mut block = tokio::select! {
            _ = cancel.cancelled() => return,
            received = rx.recv() => match received {
                Some(block) => block,
                None => return,
            },
        };

        let request = build_block_request(&block);
        match executor.process_batch(request, true).await {
            Ok(response) => {
                let conflicting = response.is_rom_level_error
                    || response.new_state_root != block.final_state_root
                    || response.block_responses.len() != 1;
                if conflicting {
                    warn!(
                        tracking_num = block.tracking_num,
                        batch_number = block.batch_number,
                        expected_root = %block.final_state_root,
                        got_root = %response.new_state_root,
                        "executor block assembly conflicts with the speculative block, \
                         triggering L2 block reorg"
                    );
                    l2_block_reorg.store(true, Ordering::Release);
                    process_in_flight.done();
                    continue;
                }

                let block_response = &response.block_responses[0];
                block.block_number = block_response.block_number;
                block.block_hash = block_response.block_hash;
                block.flush_id = response.flush_id;
                pending_flush.advance(response.flush_id);
                let _ = confirmed_root.send(block.final_state_root);

                debug!(
                    tracking_num = block.tracking_num,
                    block_number = block.block_number,
                    flush_id = block.flush_id,
                    "L2 block processed"
                );

                store_in_flight.add(1);
                if to_store.send(block).await.is_err() {
                    store_in_flight.done();
                    process_in_flight.done();
                    return;
                }
                process_in_flight.done();
            }
            Err(err) => {
                error!(
                    tracking_num = block.tracking_num,
                    error = %err,
                    "error processing L2 block, halting"
                );
                halt.halt(HaltReason::PipelineFailure(err.to_string()), false);
                process_in_flight.done();
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn store_worker(
    mut rx: mpsc::Receiver<L2Block>,
    to_stream: mpsc::Sender<L2Block>,
    state: SharedStateClient,
    pool: SharedPoolClient,
    stored_flush: FlushCursor,
    data_to_stream_count: Arc<AtomicI64>,
    store_in_flight: InFlight,
    stream_in_flight: InFlight,
    halt: HaltController,
    cancel: CancellationToken,
) {
    let mut stored_rx = stored_flush.subscribe();
    loop {
        let block = tokio::select! {
            _ = cancel.cancelled() => return,
            received = rx.recv() => match received {
                Some(block) => block,
                None => return,
            },
        };

        // The block may only surface as final once its flush id is durable.
        let flush_id = block.flush_id;
        let durable = stored_rx.wait_for(|stored| *stored >= flush_id);
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = durable => {
                if result.is_err() {
                    return;
                }
            }
        }

        match store_block(&state, &block).await {
            Ok(()) => {
                info!(
                    block_number = block.block_number,
                    batch_number = block.batch_number,
                    txs = block.transactions.len(),
                    "L2 block stored"
                );
                for tx in &block.transactions {
                    if let Err(err) = pool
                        .update_tx_status(tx.tracker.hash, PoolTxStatus::Selected, false, None)
                        .await
                    {
                        error!(tx = %tx.tracker.hash, error = %err, "failed to update tx status to selected");
                    }
                }

                let backlog = data_to_stream_count.fetch_add(1, Ordering::AcqRel) + 1;
                gauge!(DATA_TO_STREAM_BACKLOG).set(backlog as f64);
                stream_in_flight.add(1);
                if to_stream.send(block).await.is_err() {
                    stream_in_flight.done();
                    store_in_flight.done();
                    return;
                }
                store_in_flight.done();
            }
            Err(err) => {
                error!(
                    block_number = block.block_number,
                    error = %err,
                    "error storing L2 block, halting"
                );
                halt.halt(HaltReason::StoreFailure(err.to_string()), false);
                store_in_flight.done();
                return;
            }
        }
    }
}

/// Persists a block and, when it carries the batch end marker, the batch
/// closure, inside one state transaction.
async fn store_block(state: &SharedStateClient, block: &L2Block) -> StateClientResult<()> {
    let mut state_tx = state.begin_state_transaction().await?;

    let stored = block.to_stored();
    let write = async {
        state_tx.store_l2_block(stored).await?;
        if let Some(reason) = block.batch_end {
            state_tx.close_batch(block.batch_number, block.final_state_root, reason).await?;
        }
        Ok(())
    };
    let written: StateClientResult<()> = write.await;

    match written {
        Ok(()) => state_tx.commit().await,
        Err(err) => {
            if let Err(rollback_err) = state_tx.rollback().await {
                error!(error = %rollback_err, "rollback failed after store error");
            }
            Err(err)
        }
    }
}

async fn stream_worker(
    mut rx: mpsc::Receiver<L2Block>,
    stream: SharedStreamClient,
    data_to_stream_count: Arc<AtomicI64>,
    stream_in_flight: InFlight,
    cancel: CancellationToken,
) {
    loop {
        let block = tokio::select! {
            _ = cancel.cancelled() => return,
            received = rx.recv() => match received {
                Some(block) => block,
                None => return,
            },
        };

        if let Err(err) = stream.write_entries(block.stream_entries()).await {
            error!(
                block_number = block.block_number,
                error = %err,
                "failed to write L2 block to the data stream"
            );
        }

        let backlog = data_to_stream_count.fetch_sub(1, Ordering::AcqRel) - 1;
        gauge!(DATA_TO_STREAM_BACKLOG).set(backlog as f64);
        stream_in_flight.done();
    }
}
