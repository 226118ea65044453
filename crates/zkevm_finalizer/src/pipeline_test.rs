use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{B256, U256};
use pretty_assertions::assert_eq;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use zkevm_finalizer_config::BatchConstraintsConfig;
use zkevm_finalizer_types::communication::{
    MockExecutorClient,
    MockPoolClient,
    MockStateClient,
    MockStateTransaction,
    MockStreamClient,
    StateTransaction,
};
use zkevm_finalizer_types::datastream::StreamEntry;
use zkevm_finalizer_types::executor::{BlockResponse, ProcessResponse, TransactionResponse};
use zkevm_finalizer_types::l1_info_tree::L1InfoTreeUpdate;
use zkevm_finalizer_types::storage::{ClosingReason, StoredL2Block};

use crate::batch::Batch;
use crate::finalizer::HaltController;
use crate::flush_tracker::FlushCursor;
use crate::l2_block::L2Block;
use crate::pipeline::{InFlight, Pipeline, PipelineHandles};
use crate::test_utils::{other_root, tx_tracker, COINBASE};

fn test_block(index: u8, first_in_batch: bool, batch_end: Option<ClosingReason>) -> L2Block {
    let batch = Batch::open(
        1,
        COINBASE,
        other_root(index),
        B256::ZERO,
        0,
        1_700_000_000,
        1,
        BatchConstraintsConfig::default().batch_resources(),
        false,
    );
    let mut block = L2Block::open(
        index as u64,
        &batch,
        1_700_000_000 + index as u64,
        1,
        L1InfoTreeUpdate::default(),
        first_in_batch,
    );
    let mut tracker = tx_tracker(index);
    tracker.egp_percentage = 137;
    tracker.effective_gas_price = U256::from(80u64);
    let response = TransactionResponse {
        tx_hash: tracker.hash,
        from: tracker.from,
        gas_used: 21_000,
        state_root: other_root(index),
        ..Default::default()
    };
    block.add_tx(tracker, response);
    block.final_state_root = other_root(index);
    block.batch_end = batch_end;
    block
}

/// An executor that assembles blocks successfully: echoes the request's old
/// state root and hands out increasing block numbers and flush ids.
fn echo_executor() -> MockExecutorClient {
    let mut executor = MockExecutorClient::new();
    let calls = AtomicU64::new(0);
    executor.expect_process_batch().returning(move |request, _| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProcessResponse {
            new_state_root: request.old_state_root,
            block_responses: vec![BlockResponse {
                block_number: call,
                block_hash: B256::repeat_byte(call as u8),
                timestamp: request.timestamp_limit,
                transaction_responses: vec![],
            }],
            flush_id: call,
            prover_id: "P1".to_string(),
            context_id: format!("ctx-{call}"),
            ..Default::default()
        })
    });
    executor
}

fn capturing_state(stored: Arc<Mutex<Vec<StoredL2Block>>>) -> MockStateClient {
    let mut state = MockStateClient::new();
    state.expect_begin_state_transaction().returning(move || {
        let stored = stored.clone();
        let mut state_tx = MockStateTransaction::new();
        state_tx.expect_store_l2_block().returning(move |block| {
            stored.lock().expect("store lock").push(block);
            Ok(())
        });
        state_tx.expect_close_batch().returning(|_, _, _| Ok(()));
        state_tx.expect_commit().returning(|| Ok(()));
        Ok(Box::new(state_tx) as Box<dyn StateTransaction>)
    });
    state
}

fn permissive_pool() -> MockPoolClient {
    let mut pool = MockPoolClient::new();
    pool.expect_update_tx_status().returning(|_, _, _, _| Ok(()));
    pool
}

fn capturing_stream(writes: Arc<Mutex<Vec<Vec<StreamEntry>>>>) -> MockStreamClient {
    let mut stream = MockStreamClient::new();
    stream.expect_write_entries().returning(move |entries| {
        writes.lock().expect("stream lock").push(entries);
        Ok(())
    });
    stream
}

struct TestPipeline {
    handles: PipelineHandles,
    stored_flush: FlushCursor,
    l2_block_reorg: Arc<AtomicBool>,
    cancel: CancellationToken,
}

fn spawn_pipeline(
    executor: MockExecutorClient,
    state: MockStateClient,
    stream: MockStreamClient,
    stored_flush_start: u64,
) -> TestPipeline {
    let stored_flush = FlushCursor::new(stored_flush_start);
    let l2_block_reorg = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();
    let handles = Pipeline {
        executor: Arc::new(executor),
        state: Arc::new(state),
        pool: Arc::new(permissive_pool()),
        stream: Arc::new(stream),
        pending_flush: FlushCursor::new(0),
        stored_flush: stored_flush.clone(),
        l2_block_reorg: l2_block_reorg.clone(),
        confirmed_root: watch::channel(B256::ZERO).0,
        halt: HaltController::new(),
        cancel: cancel.clone(),
        buffer_size: 10,
    }
    .spawn();
    TestPipeline { handles, stored_flush, l2_block_reorg, cancel }
}

/// Blocks flow through process, store and stream strictly in submission
/// order, and batches are framed by their first and last block.
#[tokio::test]
async fn blocks_stream_in_fifo_order_with_batch_framing() {
    let stored = Arc::new(Mutex::new(Vec::new()));
    let writes = Arc::new(Mutex::new(Vec::new()));
    let pipeline = spawn_pipeline(
        echo_executor(),
        capturing_state(stored.clone()),
        capturing_stream(writes.clone()),
        1000,
    );

    pipeline.handles.submit(test_block(1, true, None)).await.expect("submit");
    pipeline.handles.submit(test_block(2, false, None)).await.expect("submit");
    pipeline
        .handles
        .submit(test_block(3, false, Some(ClosingReason::MaxTxs)))
        .await
        .expect("submit");

    tokio::time::timeout(Duration::from_secs(5), pipeline.handles.wait_all_idle())
        .await
        .expect("pipeline must drain");

    let stored = stored.lock().expect("store lock");
    assert_eq!(stored.len(), 3);
    let numbers: Vec<u64> = stored.iter().map(|block| block.header.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    let writes = writes.lock().expect("stream lock");
    assert_eq!(writes.len(), 3);
    assert!(matches!(writes[0][0], StreamEntry::BookmarkBatch { batch_number: 1 }));
    assert!(matches!(writes[0][1], StreamEntry::BatchStart(_)));
    assert!(matches!(writes[1][0], StreamEntry::BookmarkL2Block { .. }));
    assert!(matches!(writes[2].last(), Some(StreamEntry::BatchEnd(_))));

    pipeline.cancel.cancel();
}

/// Persist and re-read of a stored block preserves every per-tx field,
/// including the effective gas price and its percentage byte.
#[tokio::test]
async fn stored_blocks_preserve_the_tx_fields() {
    let stored = Arc::new(Mutex::new(Vec::new()));
    let writes = Arc::new(Mutex::new(Vec::new()));
    let pipeline = spawn_pipeline(
        echo_executor(),
        capturing_state(stored.clone()),
        capturing_stream(writes.clone()),
        1000,
    );

    pipeline.handles.submit(test_block(4, true, None)).await.expect("submit");
    tokio::time::timeout(Duration::from_secs(5), pipeline.handles.wait_all_idle())
        .await
        .expect("pipeline must drain");

    let stored = stored.lock().expect("store lock");
    let block = &stored[0];
    let tx = &block.transactions[0];
    assert_eq!(tx.egp_percentage, 137);
    assert_eq!(tx.effective_gas_price, U256::from(80u64));
    assert_eq!(tx.hash, tx_tracker(4).hash);

    // Round trip through the serialized form the store keeps.
    let json = serde_json::to_string(block).expect("serialize");
    let reread: StoredL2Block = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(&reread, block);

    pipeline.cancel.cancel();
}

/// The store stage may not surface a block before the executor reports its
/// flush id durable.
#[tokio::test(start_paused = true)]
async fn store_stage_waits_for_the_stored_flush_id() {
    let stored = Arc::new(Mutex::new(Vec::new()));
    let writes = Arc::new(Mutex::new(Vec::new()));
    let pipeline = spawn_pipeline(
        echo_executor(),
        capturing_state(stored.clone()),
        capturing_stream(writes.clone()),
        0,
    );

    pipeline.handles.submit(test_block(1, true, None)).await.expect("submit");

    // The process stage assigned flush id 1; the store stage must hold the
    // block while the stored cursor is behind.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stored.lock().expect("store lock").is_empty());

    pipeline.stored_flush.advance(1);
    tokio::time::timeout(Duration::from_secs(5), pipeline.handles.wait_all_idle())
        .await
        .expect("pipeline must drain");
    assert_eq!(stored.lock().expect("store lock").len(), 1);

    pipeline.cancel.cancel();
}

/// A block-assembly response that conflicts with the speculative block
/// raises the reorg flag and drops the block instead of storing it.
#[tokio::test]
async fn conflicting_assembly_triggers_the_reorg_flag() {
    let mut executor = MockExecutorClient::new();
    executor.expect_process_batch().returning(|_, _| {
        Ok(ProcessResponse {
            new_state_root: B256::repeat_byte(0xee),
            block_responses: vec![BlockResponse::default()],
            flush_id: 1,
            prover_id: "P1".to_string(),
            ..Default::default()
        })
    });

    let stored = Arc::new(Mutex::new(Vec::new()));
    let writes = Arc::new(Mutex::new(Vec::new()));
    let pipeline = spawn_pipeline(
        executor,
        capturing_state(stored.clone()),
        capturing_stream(writes.clone()),
        1000,
    );

    pipeline.handles.submit(test_block(1, true, None)).await.expect("submit");
    tokio::time::timeout(Duration::from_secs(5), pipeline.handles.wait_all_idle())
        .await
        .expect("pipeline must drain");

    assert!(pipeline.l2_block_reorg.load(Ordering::Acquire));
    assert!(stored.lock().expect("store lock").is_empty());
    assert!(writes.lock().expect("stream lock").is_empty());

    pipeline.cancel.cancel();
}

#[tokio::test]
async fn in_flight_wait_idle_returns_once_drained() {
    let in_flight = InFlight::default();
    in_flight.add(2);
    let waiter = {
        let in_flight = in_flight.clone();
        tokio::spawn(async move { in_flight.wait_idle().await })
    };
    in_flight.done();
    assert_eq!(in_flight.count(), 1);
    in_flight.done();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("wait_idle must return")
        .expect("waiter task must finish");
}
