use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::Notify;

use crate::datastream::StreamEntry;
use crate::executor::{ProcessRequest, ProcessResponse, ReadWriteAddresses};
use crate::forced_batch::ForcedBatch;
use crate::l1_info_tree::L1InfoTreeUpdate;
use crate::resources::{BatchResources, ZkCounters};
use crate::storage::{ClosingReason, L1Block, L2BlockHeader, PersistedBatch, StoredL2Block};
use crate::tx::TxTracker;

pub type ExecutorClientResult<T> = Result<T, ExecutorClientError>;
pub type StateClientResult<T> = Result<T, StateClientError>;
pub type PoolClientResult<T> = Result<T, PoolClientError>;
pub type BaseLayerClientResult<T> = Result<T, BaseLayerClientError>;
pub type StreamClientResult<T> = Result<T, StreamClientError>;

pub type SharedExecutorClient = Arc<dyn ExecutorClient>;
pub type SharedStateClient = Arc<dyn StateClient>;
pub type SharedWorkerClient = Arc<dyn WorkerClient>;
pub type SharedPoolClient = Arc<dyn PoolClient>;
pub type SharedBaseLayerClient = Arc<dyn BaseLayerClient>;
pub type SharedStreamClient = Arc<dyn StreamClient>;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ExecutorClientError {
    #[error("executor state db error: {0}")]
    DbError(String),
    #[error("invalid changeL2Block minTimestamp: {0}")]
    InvalidChangeL2BlockMinTimestamp(String),
    #[error("executor transport error: {0}")]
    Transport(String),
}

impl ExecutorClientError {
    /// Errors that abort the current iteration without mutating any state and
    /// are retried on the next loop pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorClientError::DbError(_)
                | ExecutorClientError::InvalidChangeL2BlockMinTimestamp(_)
        )
    }
}

/// Durability cursor and executor identity, as returned by the executor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredFlushId {
    pub flush_id: u64,
    pub prover_id: String,
}

/// The remote deterministic executor producing zk-provable state transitions.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    /// Executes a batch request. With `update_merkle_tree` unset the call is
    /// transient: no flush id is consumed and nothing is persisted.
    async fn process_batch(
        &self,
        request: ProcessRequest,
        update_merkle_tree: bool,
    ) -> ExecutorClientResult<ProcessResponse>;

    async fn get_stored_flush_id(&self) -> ExecutorClientResult<StoredFlushId>;
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum StateClientError {
    #[error("state store error: {0}")]
    Storage(String),
    #[error("not found")]
    NotFound,
}

/// Write handle over the persistent state. All writes of the store stage go
/// through one transaction; rollback on any error.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait StateTransaction: Send {
    async fn open_batch(&mut self, batch: PersistedBatch) -> StateClientResult<()>;
    async fn update_wip_batch(&mut self, batch: PersistedBatch) -> StateClientResult<()>;
    async fn close_batch(
        &mut self,
        batch_number: u64,
        final_state_root: B256,
        closing_reason: ClosingReason,
    ) -> StateClientResult<()>;
    async fn store_l2_block(&mut self, block: StoredL2Block) -> StateClientResult<()>;
    async fn commit(&mut self) -> StateClientResult<()>;
    async fn rollback(&mut self) -> StateClientResult<()>;
}

/// Read surface of the persistent state consumed by the finalizer.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait StateClient: Send + Sync {
    async fn begin_state_transaction(&self) -> StateClientResult<Box<dyn StateTransaction>>;

    async fn get_last_batch(&self) -> StateClientResult<Option<PersistedBatch>>;
    async fn get_last_l2_block_header(&self) -> StateClientResult<Option<L2BlockHeader>>;
    async fn get_last_state_root(&self) -> StateClientResult<B256>;
    async fn get_fork_id_by_batch_number(&self, batch_number: u64) -> StateClientResult<u64>;

    async fn get_forced_batches_since(
        &self,
        forced_batch_number: u64,
        max_l1_block_number: u64,
    ) -> StateClientResult<Vec<ForcedBatch>>;

    async fn get_latest_l1_info_root(
        &self,
        max_block_number: u64,
    ) -> StateClientResult<Option<L1InfoTreeUpdate>>;

    async fn get_l1_block_by_number(&self, block_number: u64)
        -> StateClientResult<Option<L1Block>>;

    async fn get_balance_by_state_root(
        &self,
        address: Address,
        state_root: B256,
    ) -> StateClientResult<U256>;

    async fn get_batches_pending_check(&self) -> StateClientResult<Vec<PersistedBatch>>;
    async fn mark_batch_checked(&self, batch_number: u64) -> StateClientResult<()>;
}

/// Outcome of asking the worker for the next transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum BestTxOutcome {
    Found(TxTracker),
    /// The worker has ready txs but none fits the remaining batch resources.
    NoFittingTx,
    /// The worker has no ready txs at all.
    NoTxAvailable,
}

/// Response of `get_best_fitting_tx`. `node_ooc_txs` are transactions proven
/// to never fit an empty batch; the caller marks them invalid exactly once.
#[derive(Clone, Debug, PartialEq)]
pub struct BestTxResponse {
    pub outcome: BestTxOutcome,
    pub node_ooc_txs: Vec<TxTracker>,
}

/// A tx dropped from the worker as a consequence of another tx's outcome,
/// to be marked failed in the pool.
#[derive(Clone, Debug, PartialEq)]
pub struct CascadeDeletedTx {
    pub hash: B256,
    pub from: Address,
    pub failed_reason: Option<String>,
}

/// The in-memory worker pool holding ready transactions sorted for selection.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Returns the most profitable tx whose needed resources fit into
    /// `remaining`, given the high-reserved deltas observed in the batch.
    async fn get_best_fitting_tx(
        &self,
        remaining: BatchResources,
        high_reserved: ZkCounters,
        is_batch_empty: bool,
    ) -> BestTxResponse;

    async fn delete_tx(&self, hash: B256, from: Address);
    async fn delete_forced_tx(&self, hash: B256, from: Address);
    async fn move_tx_pending_to_store(&self, hash: B256, from: Address);

    /// Moves the tx back to not-ready with refreshed nonce/balance hints.
    /// Returns the txs dropped by the cascading re-evaluation.
    async fn move_tx_to_not_ready(
        &self,
        hash: B256,
        from: Address,
        nonce: Option<u64>,
        balance: Option<U256>,
    ) -> Vec<CascadeDeletedTx>;

    async fn update_tx_zk_counters(
        &self,
        hash: B256,
        from: Address,
        used: ZkCounters,
        reserved: ZkCounters,
    );

    /// Applies the executor-reported post-state of the touched accounts to
    /// the worker's projections. Returns the txs invalidated by the update.
    async fn update_after_single_successful_tx_execution(
        &self,
        from: Address,
        read_write_addresses: ReadWriteAddresses,
    ) -> Vec<CascadeDeletedTx>;
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum PoolTxStatus {
    Selected,
    Invalid,
    Failed,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum PoolClientError {
    #[error("pool error: {0}")]
    Pool(String),
}

/// The transaction pool the RPC layer feeds.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PoolClient: Send + Sync {
    async fn update_tx_status(
        &self,
        hash: B256,
        status: PoolTxStatus,
        is_wip: bool,
        failed_reason: Option<String>,
    ) -> PoolClientResult<()>;

    /// Current suggested L1 and L2 gas prices.
    async fn get_l1_and_l2_gas_price(&self) -> PoolClientResult<(u64, u64)>;
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum BaseLayerClientError {
    #[error("ethereum client error: {0}")]
    Client(String),
}

/// An L1 info tree event decoded from rollup contract logs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct L1InfoTreeEvent {
    pub block_number: u64,
    pub block_hash: B256,
    pub global_exit_root: B256,
}

/// The L1 ethereum client.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait BaseLayerClient: Send + Sync {
    async fn get_latest_block_number(&self) -> BaseLayerClientResult<u64>;
    async fn header_by_number(&self, block_number: u64) -> BaseLayerClientResult<L1Block>;

    /// L1 info tree events emitted in the given (inclusive) block range, in
    /// emission order.
    async fn get_l1_info_tree_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> BaseLayerClientResult<Vec<L1InfoTreeEvent>>;

    /// Deposit count of the global exit root contract at the given block.
    async fn deposit_count(&self, at_block: Option<u64>) -> BaseLayerClientResult<U256>;

    async fn trusted_sequencer(&self) -> BaseLayerClientResult<Address>;
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum StreamClientError {
    #[error("data stream error: {0}")]
    Stream(String),
}

/// The data-stream server transport. Each call appends the given entries as
/// one atomic operation, preserving call order.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait StreamClient: Send + Sync {
    async fn write_entries(&self, entries: Vec<StreamEntry>) -> StreamClientResult<()>;
}

/// Notification that the worker gained ready transactions. Pairs a notify
/// primitive with a deadline wait; the waiting side re-polls the worker, so a
/// missed wakeup only costs one timeout.
#[derive(Clone, Debug, Default)]
pub struct ReadyTxsNotifier(Arc<Notify>);

impl ReadyTxsNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes every task currently waiting for ready txs.
    pub fn notify(&self) {
        self.0.notify_waiters();
    }

    /// Waits until notified or until `timeout` elapses. Returns whether a
    /// notification arrived.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.0.notified()).await.is_ok()
    }
}
