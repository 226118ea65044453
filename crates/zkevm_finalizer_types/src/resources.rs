use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Applies an expression to every zk counter field, by name.
macro_rules! for_each_counter {
    ($macro:ident) => {
        $macro!(gas_used);
        $macro!(keccak_hashes);
        $macro!(poseidon_hashes);
        $macro!(poseidon_paddings);
        $macro!(mem_aligns);
        $macro!(arithmetics);
        $macro!(binaries);
        $macro!(sha256_hashes);
        $macro!(steps);
    };
}

/// Per-transaction resource vector reported by the executor. The sum of every
/// axis across a batch must stay within the proving-circuit limits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ZkCounters {
    pub gas_used: u64,
    pub keccak_hashes: u64,
    pub poseidon_hashes: u64,
    pub poseidon_paddings: u64,
    pub mem_aligns: u64,
    pub arithmetics: u64,
    pub binaries: u64,
    pub sha256_hashes: u64,
    pub steps: u64,
}

impl ZkCounters {
    /// Elementwise `max(self, other)`.
    pub fn elementwise_max(&self, other: &ZkCounters) -> ZkCounters {
        let mut result = ZkCounters::default();
        macro_rules! max_field {
            ($field:ident) => {
                result.$field = self.$field.max(other.$field);
            };
        }
        for_each_counter!(max_field);
        result
    }

    /// Elementwise `self - other`, clamped at zero per axis.
    pub fn saturating_sub(&self, other: &ZkCounters) -> ZkCounters {
        let mut result = ZkCounters::default();
        macro_rules! sub_field {
            ($field:ident) => {
                result.$field = self.$field.saturating_sub(other.$field);
            };
        }
        for_each_counter!(sub_field);
        result
    }

    /// Elementwise `self + other`, saturating per axis.
    pub fn saturating_add(&self, other: &ZkCounters) -> ZkCounters {
        let mut result = ZkCounters::default();
        macro_rules! add_field {
            ($field:ident) => {
                result.$field = self.$field.saturating_add(other.$field);
            };
        }
        for_each_counter!(add_field);
        result
    }

    /// Name of the first axis on which `self < needed`, if any.
    pub fn first_exhausted_axis(&self, needed: &ZkCounters) -> Option<&'static str> {
        macro_rules! check_field {
            ($field:ident) => {
                if needed.$field > self.$field {
                    return Some(stringify!($field));
                }
            };
        }
        for_each_counter!(check_field);
        None
    }
}

/// The resources a tx must be charged against the batch: the used counters
/// plus the highest reserved-minus-used delta observed so far in the batch.
/// Returns `(needed, new_high_reserved)`.
pub fn needed_zk_counters(
    high_reserved: &ZkCounters,
    used: &ZkCounters,
    reserved: &ZkCounters,
) -> (ZkCounters, ZkCounters) {
    let delta = reserved.saturating_sub(used);
    let new_high = high_reserved.elementwise_max(&delta);
    let needed = used.saturating_add(&new_high);
    (needed, new_high)
}

/// The axis on which a batch ran out of room.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("batch resource overflow on {resource}")]
pub struct ResourceOverflow {
    pub resource: &'static str,
}

/// Remaining room in a batch: the zk-counter vector plus the raw byte budget.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BatchResources {
    pub zk_counters: ZkCounters,
    pub bytes: u64,
}

impl BatchResources {
    /// Checks whether `needed` fits into the remaining resources, reporting
    /// the first exhausted axis otherwise.
    pub fn fits(&self, needed: &BatchResources) -> Result<(), ResourceOverflow> {
        if needed.bytes > self.bytes {
            return Err(ResourceOverflow { resource: "bytes" });
        }
        match self.zk_counters.first_exhausted_axis(&needed.zk_counters) {
            Some(resource) => Err(ResourceOverflow { resource }),
            None => Ok(()),
        }
    }

    /// Subtracts `used` from the remaining resources. On underflow nothing is
    /// subtracted and the offending axis is reported.
    pub fn checked_sub(&mut self, used: &BatchResources) -> Result<(), ResourceOverflow> {
        self.fits(used)?;
        self.zk_counters = self.zk_counters.saturating_sub(&used.zk_counters);
        self.bytes -= used.bytes;
        Ok(())
    }
}
