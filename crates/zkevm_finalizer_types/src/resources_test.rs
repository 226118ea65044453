use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::resources::{needed_zk_counters, BatchResources, ResourceOverflow, ZkCounters};

fn counters(keccak: u64, steps: u64) -> ZkCounters {
    ZkCounters { keccak_hashes: keccak, steps, ..Default::default() }
}

#[test]
fn needed_counters_take_the_highest_reserved_delta() {
    let high = counters(3, 0);
    let used = counters(10, 100);
    let reserved = counters(15, 120);

    let (needed, new_high) = needed_zk_counters(&high, &used, &reserved);

    // keccak: reserved-used delta (5) exceeds the previous high (3).
    assert_eq!(needed.keccak_hashes, 15);
    assert_eq!(new_high.keccak_hashes, 5);
    // steps: delta is 20, previous high 0.
    assert_eq!(needed.steps, 120);
    assert_eq!(new_high.steps, 20);
}

#[test]
fn needed_counters_keep_previous_high_when_delta_is_smaller() {
    let high = counters(8, 50);
    let used = counters(10, 100);
    let reserved = counters(12, 110);

    let (needed, new_high) = needed_zk_counters(&high, &used, &reserved);

    assert_eq!(needed.keccak_hashes, 18);
    assert_eq!(new_high.keccak_hashes, 8);
    assert_eq!(needed.steps, 150);
    assert_eq!(new_high.steps, 50);
}

#[test]
fn reserved_below_used_contributes_no_delta() {
    let (needed, new_high) =
        needed_zk_counters(&ZkCounters::default(), &counters(10, 0), &counters(7, 0));
    assert_eq!(needed.keccak_hashes, 10);
    assert_eq!(new_high.keccak_hashes, 0);
}

#[rstest]
#[case::fits(5, 5, true)]
#[case::exact_fit(6, 6, true)]
#[case::overflow(6, 5, false)]
fn fits_reports_the_exhausted_axis(
    #[case] needed_keccak: u64,
    #[case] remaining_keccak: u64,
    #[case] fits: bool,
) {
    let remaining = BatchResources { zk_counters: counters(remaining_keccak, 100), bytes: 1000 };
    let needed = BatchResources { zk_counters: counters(needed_keccak, 10), bytes: 100 };

    let result = remaining.fits(&needed);
    if fits {
        assert_eq!(result, Ok(()));
    } else {
        assert_eq!(result, Err(ResourceOverflow { resource: "keccak_hashes" }));
    }
}

#[test]
fn fits_checks_the_byte_budget() {
    let remaining = BatchResources { zk_counters: counters(10, 10), bytes: 99 };
    let needed = BatchResources { zk_counters: ZkCounters::default(), bytes: 100 };
    assert_eq!(remaining.fits(&needed), Err(ResourceOverflow { resource: "bytes" }));
}

#[test]
fn checked_sub_leaves_resources_untouched_on_underflow() {
    let mut remaining = BatchResources { zk_counters: counters(5, 100), bytes: 50 };
    let used = BatchResources { zk_counters: counters(7, 10), bytes: 10 };

    let result = remaining.checked_sub(&used);

    assert_eq!(result, Err(ResourceOverflow { resource: "keccak_hashes" }));
    assert_eq!(remaining, BatchResources { zk_counters: counters(5, 100), bytes: 50 });
}

#[test]
fn checked_sub_conserves_resources() {
    let initial = BatchResources { zk_counters: counters(100, 1000), bytes: 4096 };
    let mut remaining = initial;
    let txs = [
        BatchResources { zk_counters: counters(10, 100), bytes: 256 },
        BatchResources { zk_counters: counters(30, 250), bytes: 512 },
    ];

    let mut spent = BatchResources::default();
    for tx in &txs {
        remaining.checked_sub(tx).expect("must not overflow");
        spent.zk_counters = spent.zk_counters.saturating_add(&tx.zk_counters);
        spent.bytes += tx.bytes;
    }

    assert_eq!(spent.zk_counters.saturating_add(&remaining.zk_counters), initial.zk_counters);
    assert_eq!(spent.bytes + remaining.bytes, initial.bytes);
}
