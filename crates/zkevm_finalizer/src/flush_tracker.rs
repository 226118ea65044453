use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use zkevm_finalizer_types::communication::SharedExecutorClient;

use crate::finalizer::{HaltController, HaltReason};
use crate::metrics::set_flush_id_gauges;

/// A monotonically non-decreasing flush-id cursor shared between tasks.
#[derive(Clone, Debug)]
pub struct FlushCursor {
    tx: watch::Sender<u64>,
}

impl FlushCursor {
    pub fn new(initial: u64) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Advances the cursor to `value` if greater. The cursor never moves
    /// backwards.
    pub fn advance(&self, value: u64) -> bool {
        self.tx.send_if_modified(|current| {
            if value > *current {
                *current = value;
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for FlushCursor {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Durability handshake with the executor: whenever work is pending
/// (`stored < pending`) the tracker polls the executor's stored flush id and
/// broadcasts every advance. A change of prover id between observations means
/// the executor restarted and the WIP batch is gone; that is a fatal halt.
pub struct FlushIdTracker {
    executor: SharedExecutorClient,
    pending: FlushCursor,
    stored: FlushCursor,
    check_interval: Duration,
    halt: HaltController,
    cancel: CancellationToken,
}

impl FlushIdTracker {
    pub fn new(
        executor: SharedExecutorClient,
        pending: FlushCursor,
        stored: FlushCursor,
        check_interval: Duration,
        halt: HaltController,
        cancel: CancellationToken,
    ) -> Self {
        Self { executor, pending, stored, check_interval, halt, cancel }
    }

    pub async fn run(self) {
        let mut pending_rx = self.pending.subscribe();
        let mut prover_id: Option<String> = None;

        loop {
            // All pending work is durable; wait for a new pending flush id.
            let stored = self.stored.get();
            let waiting = pending_rx.wait_for(|pending| *pending > stored);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = waiting => {
                    if result.is_err() {
                        return;
                    }
                }
            }

            while self.stored.get() < self.pending.get() {
                if self.cancel.is_cancelled() {
                    return;
                }
                match self.executor.get_stored_flush_id().await {
                    Ok(response) => {
                        if let Some(previous) = &prover_id {
                            if *previous != response.prover_id {
                                error!(
                                    old = %previous,
                                    new = %response.prover_id,
                                    "prover id changed, executor restarted and the WIP batch is \
                                     lost; halting"
                                );
                                self.halt.halt(
                                    HaltReason::ExecutorRestarted {
                                        old: previous.clone(),
                                        new: response.prover_id.clone(),
                                    },
                                    true,
                                );
                                return;
                            }
                        } else {
                            info!(prover_id = %response.prover_id, "executor prover id observed");
                        }
                        prover_id = Some(response.prover_id);

                        if self.stored.advance(response.flush_id) {
                            debug!(stored_flush_id = response.flush_id, "stored flush id advanced");
                        }
                        set_flush_id_gauges(self.pending.get(), self.stored.get());

                        if self.stored.get() >= self.pending.get() {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "failed to get stored flush id");
                    }
                }

                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.check_interval) => {}
                }
            }
        }
    }
}
