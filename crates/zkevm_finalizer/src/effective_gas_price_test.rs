use alloy_primitives::U256;
use pretty_assertions::assert_eq;
use rstest::rstest;
use zkevm_finalizer_config::EffectiveGasPriceConfig;

use crate::effective_gas_price::{
    effective_percentage,
    EffectiveGasPrice,
    EffectiveGasPriceError,
};
use crate::test_utils::reprocess_egp;

#[rstest]
#[case::under_half(200, 80, 102)]
#[case::half(100, 50, 127)]
#[case::full_price(100, 100, 255)]
#[case::above_price(100, 150, 255)]
#[case::one_wei_of_100(100, 1, 2)]
fn percentage_is_ceil_of_the_256_ratio(#[case] gas_price: u64, #[case] egp: u64, #[case] expected: u8) {
    let percentage = effective_percentage(U256::from(gas_price), U256::from(egp))
        .expect("percentage must compute");
    assert_eq!(percentage, expected);
}

#[rstest]
#[case::zero_gas_price(0, 10)]
#[case::zero_egp(10, 0)]
fn percentage_rejects_zero_prices(#[case] gas_price: u64, #[case] egp: u64) {
    assert_eq!(
        effective_percentage(U256::from(gas_price), U256::from(egp)),
        Err(EffectiveGasPriceError::ZeroGasPrice)
    );
}

#[test]
fn zero_gas_used_returns_the_tx_gas_price() {
    let egp = EffectiveGasPrice::new(reprocess_egp());
    let result = egp.calculate(&[1; 30], U256::from(200u64), 0, 100, 0).expect("must compute");
    assert_eq!(result, U256::from(200u64));
}

#[test]
fn zero_l1_gas_price_is_an_error() {
    let egp = EffectiveGasPrice::new(reprocess_egp());
    assert_eq!(
        egp.calculate(&[1; 30], U256::from(200u64), 100, 0, 0),
        Err(EffectiveGasPriceError::ZeroL1GasPrice)
    );
}

/// 30 non-zero bytes at cost 1 plus the 66 fixed bytes give 96 data gas;
/// at an L1 gas price of 100 the data cost is 9600, so the EGP is
/// 9600 / gas_used when the L2 leg is zero.
#[rstest]
#[case::estimate(64, 150)]
#[case::executed(120, 80)]
fn break_even_follows_the_gas_used(#[case] gas_used: u64, #[case] expected: u64) {
    let egp = EffectiveGasPrice::new(reprocess_egp());
    let result = egp
        .calculate(&[1; 30], U256::from(200u64), gas_used, 100, 0)
        .expect("must compute");
    assert_eq!(result, U256::from(expected));
}

#[test]
fn l2_leg_uses_the_floor_price() {
    let config = EffectiveGasPriceConfig {
        enabled: true,
        byte_gas_cost: 0,
        zero_byte_gas_cost: 0,
        net_profit_factor_pct: 0,
        break_even_factor_pct: 100,
        l1_gas_price_factor_pct: 25,
        min_gas_price_allowed: 0,
        ..Default::default()
    };
    let egp = EffectiveGasPrice::new(config);
    // Data gas is zero, so the EGP collapses to the L2 price: the floor is
    // l1 * 25% = 50, above the pool's 10.
    let result =
        egp.calculate(&[0; 10], U256::from(1_000u64), 1_000, 200, 10).expect("must compute");
    assert_eq!(result, U256::from(50u64));
}

#[test]
fn net_profit_and_break_even_factor_scale_the_price() {
    let config = EffectiveGasPriceConfig {
        enabled: true,
        byte_gas_cost: 0,
        zero_byte_gas_cost: 0,
        net_profit_factor_pct: 10,
        break_even_factor_pct: 110,
        l1_gas_price_factor_pct: 0,
        min_gas_price_allowed: 100,
        ..Default::default()
    };
    let egp = EffectiveGasPrice::new(config);
    // Base price 100, +10% profit = 110, *110% factor = 121.
    let result =
        egp.calculate(&[0; 10], U256::from(1_000u64), 500, 50, 0).expect("must compute");
    assert_eq!(result, U256::from(121u64));
}

#[test]
fn disabled_egp_simulates_the_tx_gas_price_from_the_l2_price() {
    let egp = EffectiveGasPrice::new(EffectiveGasPriceConfig::default());
    assert!(!egp.is_enabled());
    let (tx_gas_price, l2) = egp.tx_and_l2_gas_price(U256::from(500u64), 100, 30);
    assert_eq!(tx_gas_price, U256::from(30u64));
    assert_eq!(l2, 30);
}

#[test]
fn enabled_egp_keeps_the_tx_gas_price() {
    let egp = EffectiveGasPrice::new(reprocess_egp());
    let (tx_gas_price, l2) = egp.tx_and_l2_gas_price(U256::from(500u64), 100, 30);
    assert_eq!(tx_gas_price, U256::from(500u64));
    assert_eq!(l2, 30);
}
