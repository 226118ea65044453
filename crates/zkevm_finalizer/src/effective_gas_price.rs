use alloy_primitives::U256;
use thiserror::Error;
use zkevm_finalizer_config::EffectiveGasPriceConfig;
use zkevm_finalizer_types::executor::MAX_EFFECTIVE_PERCENTAGE;

/// Bytes charged on top of the raw RLP: the 65-byte signature plus the
/// one-byte effective percentage suffix.
const TX_FIXED_BYTES: u64 = 66;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum EffectiveGasPriceError {
    #[error("l1 gas price is zero")]
    ZeroL1GasPrice,
    #[error("gas price is zero")]
    ZeroGasPrice,
}

/// Effective-gas-price computation: derives the price a tx is actually billed
/// at from the L1 data cost of its bytes and the L2 execution cost of its
/// gas usage.
#[derive(Clone, Debug)]
pub struct EffectiveGasPrice {
    config: EffectiveGasPriceConfig,
}

impl EffectiveGasPrice {
    pub fn new(config: EffectiveGasPriceConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn final_deviation_pct(&self) -> u64 {
        self.config.final_deviation_pct
    }

    /// The tx gas price and L2 gas price used in the computation. When EGP is
    /// disabled the pool's L2 gas price stands in for the tx gas price, so
    /// the rest of the pipeline still produces a plausible egp-log.
    pub fn tx_and_l2_gas_price(
        &self,
        tx_gas_price: U256,
        _l1_gas_price: u64,
        l2_gas_price: u64,
    ) -> (U256, u64) {
        if self.config.enabled {
            (tx_gas_price, l2_gas_price)
        } else {
            (U256::from(l2_gas_price), l2_gas_price)
        }
    }

    /// Computes the effective gas price of a tx from its raw bytes and gas
    /// usage. `gas_used` equal to zero returns the tx gas price unchanged.
    pub fn calculate(
        &self,
        raw_tx: &[u8],
        tx_gas_price: U256,
        gas_used: u64,
        l1_gas_price: u64,
        l2_gas_price: u64,
    ) -> Result<U256, EffectiveGasPriceError> {
        if gas_used == 0 {
            return Ok(tx_gas_price);
        }
        if l1_gas_price == 0 {
            return Err(EffectiveGasPriceError::ZeroL1GasPrice);
        }

        let l2_floor = l1_gas_price.saturating_mul(self.config.l1_gas_price_factor_pct) / 100;
        let l2_price = l2_gas_price.max(l2_floor).max(self.config.min_gas_price_allowed);

        let zero_bytes = raw_tx.iter().filter(|byte| **byte == 0).count() as u64;
        let non_zero_bytes = raw_tx.len() as u64 - zero_bytes;
        let data_gas = non_zero_bytes * self.config.byte_gas_cost
            + zero_bytes * self.config.zero_byte_gas_cost
            + TX_FIXED_BYTES * self.config.byte_gas_cost;

        let total_cost = U256::from(data_gas) * U256::from(l1_gas_price)
            + U256::from(gas_used) * U256::from(l2_price);
        let break_even = total_cost * U256::from(100 + self.config.net_profit_factor_pct)
            / U256::from(100)
            / U256::from(gas_used);

        Ok(break_even * U256::from(self.config.break_even_factor_pct) / U256::from(100))
    }
}

/// Converts an effective gas price into the one-byte percentage appended to
/// the tx RLP: `ceil(egp * 256 / gas_price) - 1`, saturated at 255 when the
/// effective price reaches the tx gas price.
pub fn effective_percentage(
    gas_price: U256,
    effective_gas_price: U256,
) -> Result<u8, EffectiveGasPriceError> {
    if gas_price.is_zero() || effective_gas_price.is_zero() {
        return Err(EffectiveGasPriceError::ZeroGasPrice);
    }
    if gas_price <= effective_gas_price {
        return Ok(MAX_EFFECTIVE_PERCENTAGE);
    }

    let ceil_ratio =
        (effective_gas_price * U256::from(256) + gas_price - U256::from(1)) / gas_price;
    let percentage = ceil_ratio - U256::from(1);
    Ok(percentage.to::<u8>())
}
