use metrics::{counter, describe_counter, describe_gauge, gauge};
use zkevm_finalizer_types::storage::ClosingReason;

pub const PROCESSED_TXS: &str = "finalizer_processed_txs";
pub const REPROCESSED_TXS: &str = "finalizer_reprocessed_txs";
pub const FAILED_TXS: &str = "finalizer_failed_txs";
pub const OVERFLOWED_TXS: &str = "finalizer_overflowed_txs";
pub const NODE_OOC_TXS: &str = "finalizer_node_ooc_txs";
pub const CLOSED_BATCHES: &str = "finalizer_closed_batches";
pub const FORCED_BATCHES_PROCESSED: &str = "finalizer_forced_batches_processed";
pub const HALT_COUNT: &str = "finalizer_halt_count";
pub const PENDING_FLUSH_ID: &str = "finalizer_pending_flush_id";
pub const STORED_FLUSH_ID: &str = "finalizer_stored_flush_id";
pub const DATA_TO_STREAM_BACKLOG: &str = "finalizer_data_to_stream_backlog";

pub fn register_metrics() {
    describe_counter!(PROCESSED_TXS, "Counter of transactions added to a block");
    describe_counter!(REPROCESSED_TXS, "Counter of effective-gas-price reprocess passes");
    describe_counter!(FAILED_TXS, "Counter of transactions rejected with a ROM error");
    describe_counter!(OVERFLOWED_TXS, "Counter of transactions skipped on batch resource overflow");
    describe_counter!(NODE_OOC_TXS, "Counter of transactions that can never fit an empty batch");
    describe_counter!(CLOSED_BATCHES, "Counter of closed batches, labeled by closing reason");
    describe_counter!(FORCED_BATCHES_PROCESSED, "Counter of forced batches sequenced");
    describe_counter!(HALT_COUNT, "Counter of finalizer halts");
    describe_gauge!(PENDING_FLUSH_ID, "Latest flush id handed out by the executor");
    describe_gauge!(STORED_FLUSH_ID, "Latest flush id made durable by the executor");
    describe_gauge!(DATA_TO_STREAM_BACKLOG, "L2 blocks waiting to be written to the data stream");
}

pub(crate) fn increment_closed_batches(reason: ClosingReason) {
    counter!(CLOSED_BATCHES, "reason" => reason.to_string()).increment(1);
}

pub(crate) fn set_flush_id_gauges(pending: u64, stored: u64) {
    gauge!(PENDING_FLUSH_ID).set(pending as f64);
    gauge!(STORED_FLUSH_ID).set(stored as f64);
}
