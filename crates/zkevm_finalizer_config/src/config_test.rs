use pretty_assertions::assert_eq;
use rstest::rstest;
use validator::Validate;
use zkevm_finalizer_types::resources::ZkCounters;

use crate::config::{BatchConstraintsConfig, EffectiveGasPriceConfig, FinalizerConfig};

#[test]
fn default_configs_are_valid() {
    FinalizerConfig::default().validate().expect("default finalizer config must validate");
    BatchConstraintsConfig::default().validate().expect("default constraints must validate");
    EffectiveGasPriceConfig::default().validate().expect("default egp config must validate");
}

#[test]
fn zero_pipeline_buffer_is_rejected() {
    let config = FinalizerConfig { pending_l2_blocks_buffer_size: 0, ..Default::default() };
    assert!(config.validate().is_err());
}

#[test]
fn block_delta_must_not_exceed_batch_delta() {
    let config = FinalizerConfig {
        l2_block_max_delta_timestamp_secs: 10,
        batch_max_delta_timestamp_secs: 5,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[rstest]
#[case::deviation_over_100(EffectiveGasPriceConfig { final_deviation_pct: 101, ..Default::default() })]
#[case::l1_factor_over_100(EffectiveGasPriceConfig { l1_gas_price_factor_pct: 101, ..Default::default() })]
#[case::break_even_under_100(EffectiveGasPriceConfig { break_even_factor_pct: 99, ..Default::default() })]
fn invalid_egp_config_is_rejected(#[case] config: EffectiveGasPriceConfig) {
    assert!(config.validate().is_err());
}

#[test]
fn batch_resources_mirror_the_constraints() {
    let constraints = BatchConstraintsConfig::default();
    let resources = constraints.batch_resources();
    assert_eq!(resources.bytes, constraints.max_batch_bytes_size);
    assert_eq!(resources.zk_counters.keccak_hashes, constraints.max_keccak_hashes);
    assert_eq!(resources.zk_counters.steps, constraints.max_steps);
}

#[test]
fn node_level_ooc_reports_the_exceeded_axis() {
    let constraints = BatchConstraintsConfig::default();
    let reserved =
        ZkCounters { keccak_hashes: constraints.max_keccak_hashes + 1, ..Default::default() };
    let err = constraints.check_node_level_ooc(&reserved).expect_err("must exceed");
    assert_eq!(err.resource, "keccak_hashes");

    let fits = ZkCounters { keccak_hashes: constraints.max_keccak_hashes, ..Default::default() };
    assert!(constraints.check_node_level_ooc(&fits).is_ok());
}

#[test]
fn config_round_trips_through_json() {
    let config = FinalizerConfig::default();
    let json = serde_json::to_string(&config).expect("serialize");
    let back: FinalizerConfig = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, config);
}
