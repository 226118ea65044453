pub mod batch;
#[cfg(test)]
mod batch_test;
pub mod effective_gas_price;
#[cfg(test)]
mod effective_gas_price_test;
pub mod finalizer;
pub mod flush_tracker;
pub mod forced_batches;
pub mod l1_info_watcher;
pub mod l2_block;
pub mod metrics;
pub mod pipeline;
#[cfg(test)]
mod pipeline_test;
#[cfg(test)]
mod test_utils;
mod tx_processor;
