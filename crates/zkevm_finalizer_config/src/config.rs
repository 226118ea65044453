use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};
use zkevm_finalizer_types::resources::{BatchResources, ResourceOverflow, ZkCounters};

/// The finalizer related configuration.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, PartialEq)]
#[validate(schema(function = "validate_finalizer_config"))]
pub struct FinalizerConfig {
    /// How long the finalize loop waits for the worker's ready-txs signal
    /// when no transaction is available.
    pub new_txs_wait_interval_ms: u64,
    /// Cadence of the forced-batches poll against the local state.
    pub forced_batches_check_interval_ms: u64,
    /// Time a forced batch may wait in the queue before the finalizer must
    /// close the current batch and sequence it.
    pub forced_batches_timeout_secs: u64,
    /// Cadence of the L1 info tree watcher. Zero disables validation and
    /// immediately marks the last known tree valid.
    pub l1_info_tree_check_interval_ms: u64,
    /// Confirmations subtracted from the L1 head when looking for a new
    /// l1InfoRoot candidate.
    pub l1_info_tree_l1_block_confirmations: u64,
    /// Cadence of the stored-flush-id poll while pending > stored.
    pub flush_id_check_interval_ms: u64,
    /// Maximum age of the WIP L2 block before it is closed.
    pub l2_block_max_delta_timestamp_secs: u64,
    /// Maximum age of the WIP batch before it is closed
    /// (timestamp-resolution ceiling).
    pub batch_max_delta_timestamp_secs: u64,
    /// Capacity of each L2-block pipeline stage queue.
    pub pending_l2_blocks_buffer_size: usize,
    /// The batch is considered full once less than this percentage of any
    /// resource axis remains.
    pub resource_percentage_to_close_batch: u64,
    /// Halts the finalizer when it is about to open this batch number.
    /// Debug aid; zero disables it.
    pub halt_on_batch_number: u64,
    /// Optional throttle slept at every loop iteration. Zero disables it.
    pub sequencer_sleep_duration_ms: u64,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            new_txs_wait_interval_ms: 200,
            forced_batches_check_interval_ms: 10_000,
            forced_batches_timeout_secs: 60,
            l1_info_tree_check_interval_ms: 10_000,
            l1_info_tree_l1_block_confirmations: 5,
            flush_id_check_interval_ms: 50,
            l2_block_max_delta_timestamp_secs: 3,
            batch_max_delta_timestamp_secs: 1800,
            pending_l2_blocks_buffer_size: 100,
            resource_percentage_to_close_batch: 10,
            halt_on_batch_number: 0,
            sequencer_sleep_duration_ms: 0,
        }
    }
}

impl FinalizerConfig {
    pub fn new_txs_wait_interval(&self) -> Duration {
        Duration::from_millis(self.new_txs_wait_interval_ms)
    }

    pub fn forced_batches_check_interval(&self) -> Duration {
        Duration::from_millis(self.forced_batches_check_interval_ms)
    }

    pub fn forced_batches_timeout(&self) -> Duration {
        Duration::from_secs(self.forced_batches_timeout_secs)
    }

    pub fn l1_info_tree_check_interval(&self) -> Duration {
        Duration::from_millis(self.l1_info_tree_check_interval_ms)
    }

    pub fn flush_id_check_interval(&self) -> Duration {
        Duration::from_millis(self.flush_id_check_interval_ms)
    }

    pub fn l2_block_max_delta_timestamp(&self) -> Duration {
        Duration::from_secs(self.l2_block_max_delta_timestamp_secs)
    }

    pub fn batch_max_delta_timestamp(&self) -> Duration {
        Duration::from_secs(self.batch_max_delta_timestamp_secs)
    }

    pub fn sequencer_sleep_duration(&self) -> Option<Duration> {
        (self.sequencer_sleep_duration_ms > 0)
            .then(|| Duration::from_millis(self.sequencer_sleep_duration_ms))
    }
}

fn validate_finalizer_config(config: &FinalizerConfig) -> Result<(), ValidationError> {
    if config.pending_l2_blocks_buffer_size == 0 {
        return Err(ValidationError::new("pending_l2_blocks_buffer_size must be positive"));
    }
    if config.l2_block_max_delta_timestamp_secs > config.batch_max_delta_timestamp_secs {
        return Err(ValidationError::new(
            "l2_block_max_delta_timestamp_secs must not exceed batch_max_delta_timestamp_secs",
        ));
    }
    if config.resource_percentage_to_close_batch >= 100 {
        return Err(ValidationError::new(
            "resource_percentage_to_close_batch must be below 100",
        ));
    }
    Ok(())
}

/// Node-level per-batch ceilings for every zk counter, the byte budget and
/// the tx count. A tx whose reserved counters exceed these can never fit any
/// batch and is permanently invalid.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, PartialEq)]
pub struct BatchConstraintsConfig {
    #[validate(range(min = 1))]
    pub max_txs_per_batch: usize,
    #[validate(range(min = 1))]
    pub max_batch_bytes_size: u64,
    pub max_cumulative_gas_used: u64,
    pub max_keccak_hashes: u64,
    pub max_poseidon_hashes: u64,
    pub max_poseidon_paddings: u64,
    pub max_mem_aligns: u64,
    pub max_arithmetics: u64,
    pub max_binaries: u64,
    pub max_sha256_hashes: u64,
    pub max_steps: u64,
}

impl Default for BatchConstraintsConfig {
    fn default() -> Self {
        Self {
            max_txs_per_batch: 300,
            max_batch_bytes_size: 120_000,
            max_cumulative_gas_used: 1_125_899_906_842_624,
            max_keccak_hashes: 2145,
            max_poseidon_hashes: 252_357,
            max_poseidon_paddings: 135_191,
            max_mem_aligns: 236_585,
            max_arithmetics: 236_585,
            max_binaries: 473_170,
            max_sha256_hashes: 1596,
            max_steps: 7_570_538,
        }
    }
}

impl BatchConstraintsConfig {
    /// The full resource budget of a fresh batch.
    pub fn batch_resources(&self) -> BatchResources {
        BatchResources {
            zk_counters: ZkCounters {
                gas_used: self.max_cumulative_gas_used,
                keccak_hashes: self.max_keccak_hashes,
                poseidon_hashes: self.max_poseidon_hashes,
                poseidon_paddings: self.max_poseidon_paddings,
                mem_aligns: self.max_mem_aligns,
                arithmetics: self.max_arithmetics,
                binaries: self.max_binaries,
                sha256_hashes: self.max_sha256_hashes,
                steps: self.max_steps,
            },
            bytes: self.max_batch_bytes_size,
        }
    }

    /// Checks whether a tx's reserved counters exceed what an empty batch can
    /// hold (node-level out-of-counters).
    pub fn check_node_level_ooc(&self, reserved: &ZkCounters) -> Result<(), ResourceOverflow> {
        match self.batch_resources().zk_counters.first_exhausted_axis(reserved) {
            Some(resource) => Err(ResourceOverflow { resource }),
            None => Ok(()),
        }
    }
}

/// Effective-gas-price computation parameters. Percent fields are integer
/// percentages.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, PartialEq)]
#[validate(schema(function = "validate_egp_config"))]
pub struct EffectiveGasPriceConfig {
    pub enabled: bool,
    /// Accepted deviation between the first and second EGP computation before
    /// a reprocess is required.
    pub final_deviation_pct: u64,
    /// L1 calldata gas charged per non-zero tx byte.
    pub byte_gas_cost: u64,
    /// L1 calldata gas charged per zero tx byte.
    pub zero_byte_gas_cost: u64,
    /// Markup applied on top of the break-even gas price.
    pub net_profit_factor_pct: u64,
    /// Multiplier applied to the break-even gas price.
    pub break_even_factor_pct: u64,
    /// Fraction of the L1 gas price used as the L2 gas price floor.
    pub l1_gas_price_factor_pct: u64,
    /// Absolute floor for the L2 gas price used in the computation.
    pub min_gas_price_allowed: u64,
}

impl Default for EffectiveGasPriceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            final_deviation_pct: 10,
            byte_gas_cost: 16,
            zero_byte_gas_cost: 4,
            net_profit_factor_pct: 0,
            break_even_factor_pct: 100,
            l1_gas_price_factor_pct: 25,
            min_gas_price_allowed: 1_000_000_000,
        }
    }
}

fn validate_egp_config(config: &EffectiveGasPriceConfig) -> Result<(), ValidationError> {
    if config.final_deviation_pct > 100 {
        return Err(ValidationError::new("final_deviation_pct must not exceed 100"));
    }
    if config.l1_gas_price_factor_pct > 100 {
        return Err(ValidationError::new("l1_gas_price_factor_pct must not exceed 100"));
    }
    if config.break_even_factor_pct < 100 {
        return Err(ValidationError::new("break_even_factor_pct must be at least 100"));
    }
    Ok(())
}
