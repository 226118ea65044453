use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use zkevm_finalizer_types::communication::{SharedBaseLayerClient, SharedStateClient};
use zkevm_finalizer_types::forced_batch::ForcedBatch;

/// Forced batches queued for sequencing, guarded for access from the watcher
/// and the finalize loop. The deadline is the earliest `forced_at` plus the
/// configured timeout.
#[derive(Clone, Debug, Default)]
pub struct ForcedBatchesHandle {
    inner: Arc<Mutex<ForcedBatchesState>>,
}

#[derive(Debug, Default)]
struct ForcedBatchesState {
    queue: VecDeque<ForcedBatch>,
    next_deadline: Option<u64>,
    last_forced_batch_num: u64,
}

impl ForcedBatchesHandle {
    pub fn new(last_forced_batch_num: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ForcedBatchesState {
                queue: VecDeque::new(),
                next_deadline: None,
                last_forced_batch_num,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ForcedBatchesState> {
        self.inner.lock().expect("forced batches lock poisoned")
    }

    pub fn last_forced_batch_num(&self) -> u64 {
        self.lock().last_forced_batch_num
    }

    /// Appends newly discovered forced batches and arms the deadline if it
    /// is not already set.
    pub fn push_new(&self, batches: Vec<ForcedBatch>, timeout: Duration) {
        if batches.is_empty() {
            return;
        }
        let mut state = self.lock();
        for batch in batches {
            state.last_forced_batch_num =
                state.last_forced_batch_num.max(batch.forced_batch_number);
            if state.next_deadline.is_none() {
                state.next_deadline = Some(batch.forced_at + timeout.as_secs());
            }
            state.queue.push_back(batch);
        }
    }

    /// Whether the earliest queued forced batch has passed its inclusion
    /// deadline.
    pub fn deadline_reached(&self, now_secs: u64) -> bool {
        self.lock().next_deadline.is_some_and(|deadline| now_secs >= deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Drains the queue and disarms the deadline.
    pub fn take_all(&self) -> Vec<ForcedBatch> {
        let mut state = self.lock();
        state.next_deadline = None;
        state.queue.drain(..).collect()
    }
}

/// Polls the state for forced batches synced from L1 past the last one seen
/// and queues them for the finalize loop.
pub struct ForcedBatchesWatcher {
    state: SharedStateClient,
    base_layer: SharedBaseLayerClient,
    handle: ForcedBatchesHandle,
    check_interval: Duration,
    timeout: Duration,
    block_confirmations: u64,
    cancel: CancellationToken,
}

impl ForcedBatchesWatcher {
    pub fn new(
        state: SharedStateClient,
        base_layer: SharedBaseLayerClient,
        handle: ForcedBatchesHandle,
        check_interval: Duration,
        timeout: Duration,
        block_confirmations: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self { state, base_layer, handle, check_interval, timeout, block_confirmations, cancel }
    }

    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.check_interval) => {}
            }

            let last_l1_block = match self.base_layer.get_latest_block_number().await {
                Ok(number) => number,
                Err(err) => {
                    error!(error = %err, "error getting latest L1 block number");
                    continue;
                }
            };
            let max_block_number = last_l1_block.saturating_sub(self.block_confirmations);

            let since = self.handle.last_forced_batch_num();
            match self.state.get_forced_batches_since(since, max_block_number).await {
                Ok(batches) => {
                    if !batches.is_empty() {
                        info!(count = batches.len(), since, "new forced batches queued");
                        self.handle.push_new(batches, self.timeout);
                    }
                }
                Err(err) => {
                    error!(error = %err, "error getting forced batches from the state");
                }
            }
        }
    }
}
