use alloy_primitives::B256;
use pretty_assertions::assert_eq;
use rstest::rstest;
use zkevm_finalizer_config::BatchConstraintsConfig;
use zkevm_finalizer_types::resources::{BatchResources, ZkCounters};
use zkevm_finalizer_types::storage::{BatchStage, ClosingReason};

use crate::batch::Batch;
use crate::test_utils::{initial_root, other_root, small_counters, COINBASE};

fn open_batch() -> Batch {
    Batch::open(
        7,
        COINBASE,
        initial_root(),
        B256::ZERO,
        3,
        1_700_000_000,
        1,
        BatchConstraintsConfig::default().batch_resources(),
        false,
    )
}

#[test]
fn a_fresh_batch_starts_open_and_empty() {
    let batch = open_batch();
    assert!(batch.is_empty());
    assert_eq!(batch.stage, BatchStage::Open);
    assert_eq!(batch.closing_reason, None);
    assert_eq!(batch.im_state_root, initial_root());
    assert_eq!(batch.remaining_resources, batch.initial_resources);
}

/// Spent plus remaining always equals the initial budget, on every axis.
#[test]
fn resource_accounting_is_conserved_across_subtractions() {
    let mut batch = open_batch();
    let txs = [
        BatchResources { zk_counters: small_counters(), bytes: 256 },
        BatchResources { zk_counters: small_counters(), bytes: 1024 },
        BatchResources { zk_counters: small_counters(), bytes: 32 },
    ];

    let mut spent = BatchResources::default();
    for tx in &txs {
        batch.remaining_resources.checked_sub(tx).expect("must fit");
        spent.zk_counters = spent.zk_counters.saturating_add(&tx.zk_counters);
        spent.bytes += tx.bytes;
    }

    assert_eq!(batch.used_resources(), spent);
    assert_eq!(
        spent.zk_counters.saturating_add(&batch.remaining_resources.zk_counters),
        batch.initial_resources.zk_counters
    );
    assert_eq!(spent.bytes + batch.remaining_resources.bytes, batch.initial_resources.bytes);
}

#[rstest]
#[case::plenty_left(false)]
#[case::exhausted(true)]
fn margin_exhaustion_follows_the_remaining_share(#[case] exhausted: bool) {
    let mut batch = open_batch();
    if exhausted {
        // Drain keccak below 10% of its budget.
        let max_keccak = batch.initial_resources.zk_counters.keccak_hashes;
        batch
            .remaining_resources
            .checked_sub(&BatchResources {
                zk_counters: ZkCounters {
                    keccak_hashes: max_keccak - max_keccak / 20,
                    ..Default::default()
                },
                bytes: 0,
            })
            .expect("must fit");
    }
    assert_eq!(batch.resources_margin_exhausted(10), exhausted);
}

#[test]
fn closing_promotes_the_intermediate_root_and_seals() {
    let mut batch = open_batch();
    batch.im_state_root = other_root(9);

    batch.start_closing(ClosingReason::MaxTxs);
    assert_eq!(batch.stage, BatchStage::Closing);
    assert_eq!(batch.closing_reason, Some(ClosingReason::MaxTxs));

    batch.seal();
    assert_eq!(batch.stage, BatchStage::Closed);
    assert_eq!(batch.final_state_root, other_root(9));
}

#[test]
fn persisted_round_trip_resumes_the_accounting() {
    let mut batch = open_batch();
    batch.im_state_root = other_root(5);
    batch.count_of_txs = 12;
    batch.count_of_l2_blocks = 3;
    batch
        .remaining_resources
        .checked_sub(&BatchResources { zk_counters: small_counters(), bytes: 512 })
        .expect("must fit");
    batch.high_reserved_zk_counters = ZkCounters { keccak_hashes: 7, ..Default::default() };

    let mut persisted = batch.to_persisted();
    // An open batch row carries the intermediate root as its final root.
    persisted.final_state_root = batch.im_state_root;

    let resumed = Batch::from_persisted(&persisted, batch.initial_resources);
    assert_eq!(resumed.batch_number, batch.batch_number);
    assert_eq!(resumed.im_state_root, batch.im_state_root);
    assert_eq!(resumed.count_of_txs, batch.count_of_txs);
    assert_eq!(resumed.count_of_l2_blocks, batch.count_of_l2_blocks);
    assert_eq!(resumed.remaining_resources, batch.remaining_resources);
    assert_eq!(resumed.high_reserved_zk_counters, batch.high_reserved_zk_counters);
    assert_eq!(resumed.stage, BatchStage::Open);
    assert_eq!(resumed.closing_reason, None);
}
