use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};
use tokio_util::sync::CancellationToken;
use zkevm_finalizer_config::{BatchConstraintsConfig, EffectiveGasPriceConfig, FinalizerConfig};
use zkevm_finalizer_types::communication::{
    MockBaseLayerClient,
    MockExecutorClient,
    MockPoolClient,
    MockStateClient,
    MockStreamClient,
    MockWorkerClient,
    ReadyTxsNotifier,
};
use zkevm_finalizer_types::executor::{
    AccountUpdate,
    BlockResponse,
    ProcessResponse,
    TransactionResponse,
};
use zkevm_finalizer_types::resources::ZkCounters;
use zkevm_finalizer_types::tx::TxTracker;

use crate::batch::Batch;
use crate::finalizer::Finalizer;
use crate::pipeline::Pipeline;

pub(crate) const COINBASE: Address = Address::repeat_byte(0xaa);

pub(crate) fn initial_root() -> B256 {
    B256::repeat_byte(1)
}

pub(crate) fn other_root(index: u8) -> B256 {
    B256::repeat_byte(index)
}

pub(crate) fn tx_hash(index: u8) -> B256 {
    B256::repeat_byte(index)
}

pub(crate) fn sender(index: u8) -> Address {
    Address::repeat_byte(index)
}

pub(crate) fn small_counters() -> ZkCounters {
    ZkCounters {
        gas_used: 21_000,
        keccak_hashes: 10,
        poseidon_hashes: 20,
        poseidon_paddings: 5,
        mem_aligns: 15,
        arithmetics: 25,
        binaries: 8,
        sha256_hashes: 4,
        steps: 500,
    }
}

pub(crate) fn reserved_counters() -> ZkCounters {
    let mut counters = small_counters();
    counters.keccak_hashes += 2;
    counters.steps += 50;
    counters
}

pub(crate) fn tx_tracker(index: u8) -> TxTracker {
    TxTracker {
        hash: tx_hash(index),
        from: sender(index),
        nonce: 1,
        gas_price: U256::from(100u64),
        raw_tx: Bytes::from(vec![index.max(1); 32]),
        used_zk_counters: small_counters(),
        reserved_zk_counters: reserved_counters(),
        ..Default::default()
    }
}

/// A successful single-tx executor response advancing the state to
/// `new_state_root`.
pub(crate) fn success_response(tx: &TxTracker, new_state_root: B256) -> ProcessResponse {
    let mut read_write_addresses = indexmap::IndexMap::new();
    read_write_addresses.insert(
        tx.from,
        AccountUpdate { nonce: Some(tx.nonce + 1), balance: Some(U256::from(1_000_000u64)) },
    );
    ProcessResponse {
        new_state_root,
        block_responses: vec![BlockResponse {
            block_number: 0,
            block_hash: B256::ZERO,
            timestamp: 0,
            transaction_responses: vec![TransactionResponse {
                tx_hash: tx.hash,
                from: tx.from,
                rom_error: None,
                gas_used: 21_000,
                state_root: new_state_root,
                ..Default::default()
            }],
        }],
        used_zk_counters: small_counters(),
        reserved_zk_counters: reserved_counters(),
        read_write_addresses,
        is_rom_level_error: false,
        flush_id: 1,
        prover_id: "P1".to_string(),
        context_id: "ctx-1".to_string(),
    }
}

pub(crate) fn test_config() -> FinalizerConfig {
    FinalizerConfig {
        new_txs_wait_interval_ms: 10,
        forced_batches_check_interval_ms: 50,
        forced_batches_timeout_secs: 60,
        l1_info_tree_check_interval_ms: 0,
        flush_id_check_interval_ms: 5,
        l2_block_max_delta_timestamp_secs: 1,
        ..Default::default()
    }
}

pub(crate) fn disabled_egp() -> EffectiveGasPriceConfig {
    EffectiveGasPriceConfig::default()
}

/// EGP parameters chosen so a tx with 30 non-zero raw bytes and a gas price
/// of 200 yields an EGP of 150 at a 64-gas estimate and 80 at 120 executed
/// gas (data gas 96, L1 gas price 100).
pub(crate) fn reprocess_egp() -> EffectiveGasPriceConfig {
    EffectiveGasPriceConfig {
        enabled: true,
        final_deviation_pct: 10,
        byte_gas_cost: 1,
        zero_byte_gas_cost: 1,
        net_profit_factor_pct: 0,
        break_even_factor_pct: 100,
        l1_gas_price_factor_pct: 0,
        min_gas_price_allowed: 0,
    }
}

pub(crate) fn test_finalizer(
    executor: MockExecutorClient,
    state: MockStateClient,
    worker: MockWorkerClient,
    pool: MockPoolClient,
    egp_config: EffectiveGasPriceConfig,
) -> Finalizer {
    test_finalizer_with_clients(
        executor,
        state,
        worker,
        pool,
        MockBaseLayerClient::new(),
        MockStreamClient::new(),
        egp_config,
        CancellationToken::new(),
    )
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn test_finalizer_with_clients(
    executor: MockExecutorClient,
    state: MockStateClient,
    worker: MockWorkerClient,
    pool: MockPoolClient,
    base_layer: MockBaseLayerClient,
    stream: MockStreamClient,
    egp_config: EffectiveGasPriceConfig,
    cancel: CancellationToken,
) -> Finalizer {
    Finalizer::new(
        test_config(),
        BatchConstraintsConfig::default(),
        egp_config,
        COINBASE,
        Arc::new(executor),
        Arc::new(state),
        Arc::new(worker),
        Arc::new(pool),
        Arc::new(base_layer),
        Arc::new(stream),
        ReadyTxsNotifier::new(),
        cancel,
    )
}

/// Spawns a pipeline over the finalizer's own clients, as `run` does before
/// entering the loop.
pub(crate) fn attach_pipeline(finalizer: &mut Finalizer) {
    let handles = Pipeline {
        executor: finalizer.executor.clone(),
        state: finalizer.state.clone(),
        pool: finalizer.pool.clone(),
        stream: finalizer.stream.clone(),
        pending_flush: finalizer.pending_flush.clone(),
        stored_flush: finalizer.stored_flush.clone(),
        l2_block_reorg: finalizer.l2_block_reorg.clone(),
        confirmed_root: finalizer.confirmed_root.clone(),
        halt: finalizer.halt.clone(),
        cancel: finalizer.cancel.clone(),
        buffer_size: 10,
    }
    .spawn();
    finalizer.pipeline = Some(handles);
}

/// Seeds the finalizer with an open batch #1 and a fresh WIP L2 block, as
/// `init_wip_batch`/`init_wip_l2_block` would after startup.
pub(crate) fn open_test_batch(finalizer: &mut Finalizer) {
    let batch = Batch::open(
        1,
        COINBASE,
        initial_root(),
        B256::ZERO,
        0,
        1_700_000_000,
        1,
        BatchConstraintsConfig::default().batch_resources(),
        false,
    );
    finalizer.fork_id = 1;
    finalizer.wip_batch = Some(batch);
    finalizer.open_wip_l2_block();
}
