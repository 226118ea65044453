use alloy_primitives::{B256, U256};
use metrics::counter;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use zkevm_finalizer_types::communication::{
    ExecutorClientError,
    PoolClientError,
    PoolTxStatus,
};
use zkevm_finalizer_types::executor::{
    ProcessRequest,
    ProcessResponse,
    RomError,
    TransactionResponse,
    MAX_EFFECTIVE_PERCENTAGE,
};
use zkevm_finalizer_types::resources::{needed_zk_counters, BatchResources, ResourceOverflow};
use zkevm_finalizer_types::tx::TxTracker;

use crate::effective_gas_price::{effective_percentage, EffectiveGasPriceError};
use crate::finalizer::{Finalizer, HaltReason};
use crate::metrics::{NODE_OOC_TXS, PROCESSED_TXS};

/// Whether a tx is being processed for the first time or reprocessed with a
/// pinned effective gas price.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TxAttempt {
    First,
    Reprocess,
}

#[derive(Debug, Error)]
pub(crate) enum ProcessTxError {
    /// The tx must be re-executed with the updated effective gas price.
    #[error("effective gas price reprocess")]
    EffectiveGasPriceReprocess,
    /// The tx doesn't fit the remaining batch resources; it stays in the
    /// worker for a later batch.
    #[error(transparent)]
    BatchResourceOverflow(ResourceOverflow),
    #[error(transparent)]
    Executor(#[from] ExecutorClientError),
    #[error("rom error: {0}")]
    Rom(RomError),
    #[error(transparent)]
    EffectiveGasPrice(#[from] EffectiveGasPriceError),
    #[error(transparent)]
    Pool(#[from] PoolClientError),
    #[error("executor returned no block responses")]
    ZeroBlockResponses,
}

impl Finalizer {
    /// Processes a single transaction. On success the tx is appended to the
    /// WIP L2 block and the batch accounting is updated.
    pub(crate) async fn process_transaction(
        &mut self,
        tx: &mut TxTracker,
        attempt: TxAttempt,
    ) -> Result<(), ProcessTxError> {
        let start = Instant::now();
        info!(
            tx = %tx.hash,
            batch_number = self.wip_batch().batch_number,
            l2_block = self.wip_l2_block().tracking_num,
            old_state_root = %self.wip_batch().im_state_root,
            l1_info_tree_index = self.wip_l2_block().l1_info_tree.index,
            "processing tx"
        );

        let tx_gas_price = self.compute_effective_gas_price(tx, attempt).await?;

        match effective_percentage(tx_gas_price, tx.effective_gas_price) {
            Ok(percentage) => {
                tx.egp_log.percentage = percentage;
                tx.egp_percentage = percentage;
            }
            Err(err) => {
                if self.egp.is_enabled() {
                    return Err(err.into());
                }
                warn!(tx = %tx.hash, error = %err, "effective gas price is disabled, but failed to calculate the effective percentage");
                append_egp_error(tx, &format!("effective percentage: {err}"));
            }
        }
        // With EGP disabled the tx is billed at its full gas price.
        if !self.egp.is_enabled() {
            tx.egp_percentage = MAX_EFFECTIVE_PERCENTAGE;
        }

        let mut transactions = tx.raw_tx.to_vec();
        transactions.push(tx.egp_percentage);
        let request = ProcessRequest {
            batch_number: self.wip_batch().batch_number,
            old_state_root: self.wip_batch().im_state_root,
            coinbase: self.wip_batch().coinbase,
            fork_id: self.fork_id,
            timestamp_limit: self.wip_l2_block().timestamp,
            l1_info_root: B256::ZERO,
            transactions: transactions.into(),
            skip_first_change_l2_block: true,
            skip_write_block_info_root: true,
            skip_verify_l1_info_root: true,
            l1_info_tree_data: Default::default(),
        };

        let execution_start = Instant::now();
        let result = self.executor.process_batch(request, true).await;
        let execution_time = execution_start.elapsed();
        self.wip_l2_block_mut().metrics.executor_time += execution_time;

        let response = match result {
            Err(err) if err.is_retryable() => {
                error!(tx = %tx.hash, error = %err, "failed to process tx");
                return Err(err.into());
            }
            Err(err) => {
                error!(tx = %tx.hash, error = %err, "error received from executor");
                self.worker.delete_tx(tx.hash, tx.from).await;
                if let Err(pool_err) = self
                    .pool
                    .update_tx_status(tx.hash, PoolTxStatus::Invalid, false, Some(err.to_string()))
                    .await
                {
                    error!(tx = %tx.hash, error = %pool_err, "failed to update tx status to invalid in the pool");
                }
                return Err(err.into());
            }
            Ok(response) => response,
        };

        if response.block_responses.is_empty() {
            if !response.is_rom_level_error {
                // A successful response with zero block responses breaks the
                // one-tx-one-block contract; operator intervention needed.
                self.halt.halt(HaltReason::ZeroBlockResponses { tx_hash: tx.hash }, false);
            }
            return Err(ProcessTxError::ZeroBlockResponses);
        }

        let old_state_root = self.wip_batch().im_state_root;
        self.handle_process_transaction_response(tx, &response, old_state_root).await?;

        self.wip_batch_mut().im_state_root = response.new_state_root;
        self.pending_flush.advance(response.flush_id);

        info!(
            tx = %tx.hash,
            batch_number = self.wip_batch().batch_number,
            l2_block = self.wip_l2_block().tracking_num,
            new_state_root = %response.new_state_root,
            old_state_root = %old_state_root,
            process_time = ?start.elapsed(),
            executor_time = ?execution_time,
            context_id = %response.context_id,
            "processed tx"
        );
        Ok(())
    }

    /// First-pass effective gas price: pins the pool gas prices into the
    /// tracker and derives the initial EGP from the pre-execution gas
    /// estimate. Returns the tx gas price used for the percentage.
    async fn compute_effective_gas_price(
        &mut self,
        tx: &mut TxTracker,
        attempt: TxAttempt,
    ) -> Result<U256, ProcessTxError> {
        if attempt == TxAttempt::Reprocess {
            let (tx_gas_price, _) =
                self.egp.tx_and_l2_gas_price(tx.gas_price, tx.l1_gas_price, tx.l2_gas_price);
            return Ok(tx_gas_price);
        }

        // Pin the pool gas prices for the lifespan of the transaction.
        let (l1_gas_price, l2_gas_price) = self.pool.get_l1_and_l2_gas_price().await?;
        tx.l1_gas_price = l1_gas_price;
        tx.l2_gas_price = l2_gas_price;

        let (tx_gas_price, tx_l2_gas_price) =
            self.egp.tx_and_l2_gas_price(tx.gas_price, l1_gas_price, l2_gas_price);
        tx.egp_log.l1_gas_price = l1_gas_price;
        tx.egp_log.l2_gas_price = tx_l2_gas_price;
        tx.egp_log.gas_used_first = tx.used_zk_counters.gas_used;
        tx.egp_log.gas_price = tx_gas_price;

        match self.egp.calculate(
            &tx.raw_tx,
            tx_gas_price,
            tx.used_zk_counters.gas_used,
            l1_gas_price,
            tx_l2_gas_price,
        ) {
            Err(err) => {
                if self.egp.is_enabled() {
                    return Err(err.into());
                }
                warn!(tx = %tx.hash, error = %err, "effective gas price is disabled, but failed to calculate it");
                append_egp_error(tx, &format!("calculate effective gas price (first): {err}"));
            }
            Ok(effective_gas_price) => {
                tx.effective_gas_price = effective_gas_price;
                tx.egp_log.value_first = effective_gas_price;

                // At or above the tx gas price there is nothing to undercut:
                // bill the full price and skip the reprocess pass.
                if tx.effective_gas_price >= tx_gas_price {
                    let loss = tx.effective_gas_price - tx_gas_price;
                    if loss > U256::ZERO {
                        info!(
                            event = "egp_loss",
                            tx = %tx.hash,
                            gas_price = %tx_gas_price,
                            effective_gas_price = %tx.effective_gas_price,
                            loss = %loss,
                            "fee loss on first effective gas price computation"
                        );
                    }
                    tx.effective_gas_price = tx_gas_price;
                    tx.is_last_execution = true;
                }
            }
        }

        if !self.egp.is_enabled() {
            tx.effective_gas_price = tx.gas_price;
        }
        Ok(tx_gas_price)
    }

    /// Handles the executor response of a single-tx request: ROM error
    /// classification, the second EGP pass, resource accounting and the
    /// worker/pool bookkeeping of a successful execution.
    async fn handle_process_transaction_response(
        &mut self,
        tx: &mut TxTracker,
        response: &ProcessResponse,
        _old_state_root: B256,
    ) -> Result<(), ProcessTxError> {
        let tx_response =
            response.first_tx_response().ok_or(ProcessTxError::ZeroBlockResponses)?.clone();
        self.wip_l2_block_mut().metrics.processed_tx_count += 1;

        if !tx_response.changes_state_root() {
            // Intrinsic and out-of-counters errors never advance the
            // intermediate state root; the tx is not added to the batch.
            self.handle_process_transaction_error(tx, response, &tx_response).await;
            let rom_error =
                tx_response.rom_error.expect("a non-advancing response carries a ROM error");
            return Err(ProcessTxError::Rom(rom_error));
        }

        let egp_enabled = self.egp.is_enabled();
        if !tx.is_last_execution {
            tx.is_last_execution = true;

            let (tx_gas_price, tx_l2_gas_price) =
                self.egp.tx_and_l2_gas_price(tx.gas_price, tx.l1_gas_price, tx.l2_gas_price);
            match self.egp.calculate(
                &tx.raw_tx,
                tx_gas_price,
                tx_response.gas_used,
                tx.l1_gas_price,
                tx_l2_gas_price,
            ) {
                Err(err) => {
                    if egp_enabled {
                        error!(tx = %tx.hash, error = %err, "failed to calculate effective gas price with the executed gas");
                        return Err(err.into());
                    }
                    warn!(tx = %tx.hash, error = %err, "effective gas price is disabled, but failed to recalculate it");
                    append_egp_error(tx, &format!("calculate effective gas price (second): {err}"));
                }
                Ok(new_effective_gas_price) => {
                    tx.egp_log.value_second = new_effective_gas_price;
                    tx.egp_log.gas_used_second = tx_response.gas_used;

                    let reprocess = compare_tx_effective_gas_price(
                        tx,
                        new_effective_gas_price,
                        tx_gas_price,
                        tx_response.has_gas_price_opcode,
                        tx_response.has_balance_opcode,
                        self.egp.final_deviation_pct(),
                    );

                    if !egp_enabled {
                        match effective_percentage(tx_gas_price, tx.effective_gas_price) {
                            Ok(percentage) => tx.egp_log.percentage = percentage,
                            Err(err) => {
                                warn!(tx = %tx.hash, error = %err, "effective gas price is disabled, but failed to recalculate the effective percentage");
                                append_egp_error(tx, &format!("effective percentage (second): {err}"));
                            }
                        }
                    }

                    if reprocess && egp_enabled {
                        return Err(ProcessTxError::EffectiveGasPriceReprocess);
                    }
                }
            }

            // With EGP disabled the comparison above is trace-only; the tx
            // stays billed at its full gas price.
            if !egp_enabled {
                tx.effective_gas_price = tx.gas_price;
            }
        }

        // Charge the tx against the batch: the used counters plus the highest
        // reserved-minus-used delta observed so far.
        let (needed, new_high) = needed_zk_counters(
            &self.wip_batch().high_reserved_zk_counters,
            &response.used_zk_counters,
            &response.reserved_zk_counters,
        );
        let needed_resources = BatchResources { zk_counters: needed, bytes: tx.size() };
        let used_resources =
            BatchResources { zk_counters: response.used_zk_counters, bytes: tx.size() };

        let fits = self.wip_batch().remaining_resources.fits(&needed_resources).err();
        let mut sub_overflow = None;
        match &fits {
            None => {
                if let Err(overflow) =
                    self.wip_batch_mut().remaining_resources.checked_sub(&used_resources)
                {
                    // Cannot happen: needed covers used on every axis.
                    error!(
                        event = "used_zk_counters_overflow",
                        tx = %tx.hash,
                        resource = overflow.resource,
                        "tx used resources exceed the remaining batch resources after a positive fit check"
                    );
                    sub_overflow = Some(overflow);
                }
                self.wip_batch_mut().high_reserved_zk_counters = new_high;
            }
            Some(overflow) => {
                info!(
                    tx = %tx.hash,
                    resource = overflow.resource,
                    "tx needed resources exceed the remaining batch resources"
                );
                if let Err(node_ooc) =
                    self.constraints.check_node_level_ooc(&response.reserved_zk_counters)
                {
                    info!(
                        event = "node_ooc",
                        tx = %tx.hash,
                        from = %tx.from,
                        resource = node_ooc.resource,
                        "tx reserved resources exceed the node-level batch limits, setting tx as invalid in the pool"
                    );
                    counter!(NODE_OOC_TXS).increment(1);
                    self.worker.delete_tx(tx.hash, tx.from).await;
                    if let Err(err) = self
                        .pool
                        .update_tx_status(
                            tx.hash,
                            PoolTxStatus::Invalid,
                            false,
                            Some("node OOC".to_string()),
                        )
                        .await
                    {
                        error!(tx = %tx.hash, error = %err, "failed to update tx status to invalid in the pool");
                    }
                    return Err(ProcessTxError::BatchResourceOverflow(node_ooc));
                }
            }
        }

        if let Some(overflow) = fits.or(sub_overflow) {
            self.worker
                .update_tx_zk_counters(
                    tx.hash,
                    tx.from,
                    response.used_zk_counters,
                    response.reserved_zk_counters,
                )
                .await;
            return Err(ProcessTxError::BatchResourceOverflow(overflow));
        }

        tx.egp_log.enabled = egp_enabled;
        tx.egp_log.gas_price_opcode = tx_response.has_gas_price_opcode;
        tx.egp_log.balance_opcode = tx_response.has_balance_opcode;
        tx.egp_log.value_final = tx.effective_gas_price;
        info!(
            event = "egp_log",
            tx = %tx.hash,
            value_final = %tx.egp_log.value_final,
            value_first = %tx.egp_log.value_first,
            value_second = %tx.egp_log.value_second,
            percentage = tx.egp_log.percentage,
            deviation = %tx.egp_log.final_deviation,
            max_deviation = %tx.egp_log.max_deviation,
            gas_used_first = tx.egp_log.gas_used_first,
            gas_used_second = tx.egp_log.gas_used_second,
            gas_price = %tx.egp_log.gas_price,
            l1_gas_price = tx.egp_log.l1_gas_price,
            l2_gas_price = tx.egp_log.l2_gas_price,
            reprocess = tx.egp_log.reprocess,
            gas_price_opcode = tx.egp_log.gas_price_opcode,
            balance_opcode = tx.egp_log.balance_opcode,
            enabled = tx.egp_log.enabled,
            tx_size = tx.raw_tx.len(),
            error = tx.egp_log.error.as_deref().unwrap_or(""),
            "effective gas price trace"
        );

        self.wip_l2_block_mut().add_tx(tx.clone(), tx_response.clone());
        self.wip_batch_mut().count_of_txs += 1;
        counter!(PROCESSED_TXS).increment(1);

        self.update_worker_after_successful_processing(tx.hash, tx.from, false, response).await;
        Ok(())
    }

    /// Worker/pool bookkeeping for a tx whose execution advanced the state
    /// root. On a ROM out-of-gas the sender balance is re-read at the current
    /// state root and injected into the executor's touched-account updates so
    /// the worker's balance projection stays consistent.
    pub(crate) async fn update_worker_after_successful_processing(
        &self,
        tx_hash: B256,
        tx_from: alloy_primitives::Address,
        is_forced: bool,
        response: &ProcessResponse,
    ) {
        if is_forced {
            self.worker.delete_forced_tx(tx_hash, tx_from).await;
            debug!(tx = %tx_hash, from = %tx_from, "forced tx deleted from worker");
            return;
        }
        self.worker.move_tx_pending_to_store(tx_hash, tx_from).await;
        debug!(tx = %tx_hash, from = %tx_from, "tx moved to pending to store in worker");

        let mut read_write_addresses = response.read_write_addresses.clone();
        let sender_touched = read_write_addresses.contains_key(&tx_from);
        let out_of_gas = response
            .first_tx_response()
            .and_then(|tx_response| tx_response.rom_error)
            .is_some_and(|rom_error| rom_error.is_out_of_gas());
        if sender_touched && out_of_gas {
            match self.state.get_last_state_root().await {
                Ok(state_root) => {
                    match self.state.get_balance_by_state_root(tx_from, state_root).await {
                        Ok(balance) => {
                            info!(
                                address = %tx_from,
                                balance = %balance,
                                "refreshed sender balance after ROM out-of-gas"
                            );
                            if let Some(update) = read_write_addresses.get_mut(&tx_from) {
                                // The nonce is deliberately left as reported.
                                update.balance = Some(balance);
                            }
                        }
                        Err(err) => {
                            error!(address = %tx_from, error = %err, "failed to get the sender balance");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to get the last state root");
                }
            }
        }

        let txs_to_delete = self
            .worker
            .update_after_single_successful_tx_execution(tx_from, read_write_addresses)
            .await;
        for tx_to_delete in txs_to_delete {
            if let Err(err) = self
                .pool
                .update_tx_status(
                    tx_to_delete.hash,
                    PoolTxStatus::Failed,
                    false,
                    tx_to_delete.failed_reason,
                )
                .await
            {
                error!(tx = %tx_to_delete.hash, error = %err, "failed to update tx status to failed in the pool");
            }
        }
    }

    /// ROM error classification for txs that did not advance the state root.
    async fn handle_process_transaction_error(
        &mut self,
        tx: &TxTracker,
        response: &ProcessResponse,
        tx_response: &TransactionResponse,
    ) {
        let error_code =
            tx_response.rom_error.expect("a non-advancing response carries a ROM error");
        info!(tx = %tx.hash, error_code = %error_code, "rom error in tx");
        let failed_reason = error_code.to_string();

        if error_code.is_out_of_counters() {
            error!(tx = %tx.hash, error_code = %error_code, "ROM out of counters error, marking tx as invalid");
            self.worker.delete_tx(tx.hash, tx.from).await;
            if let Err(err) = self
                .pool
                .update_tx_status(tx.hash, PoolTxStatus::Invalid, false, Some(failed_reason))
                .await
            {
                error!(tx = %tx.hash, error = %err, "failed to update tx status to invalid in the pool");
            }
        } else if error_code.is_intrinsic_nonce() || error_code.is_intrinsic_balance() {
            let address_info = response.read_write_addresses.get(&tx.from);
            let nonce = address_info.and_then(|info| info.nonce);
            let balance = address_info.and_then(|info| info.balance);
            error!(
                tx = %tx.hash,
                ?nonce,
                ?balance,
                gas_price = %tx.gas_price,
                error_code = %error_code,
                "intrinsic error, moving tx to not ready"
            );
            let txs_to_delete =
                self.worker.move_tx_to_not_ready(tx.hash, tx.from, nonce, balance).await;
            for tx_to_delete in txs_to_delete {
                if let Err(err) = self
                    .pool
                    .update_tx_status(
                        tx_to_delete.hash,
                        PoolTxStatus::Failed,
                        false,
                        Some(failed_reason.clone()),
                    )
                    .await
                {
                    error!(tx = %tx_to_delete.hash, error = %err, "failed to update tx status to failed in the pool");
                }
            }
        } else {
            self.worker.delete_tx(tx.hash, tx.from).await;
            debug!(tx = %tx.hash, from = %tx.from, "tx deleted from worker pool");
            if let Err(err) = self
                .pool
                .update_tx_status(tx.hash, PoolTxStatus::Failed, false, Some(failed_reason))
                .await
            {
                error!(tx = %tx.hash, error = %err, "failed to update tx status to failed in the pool");
            }
        }

        self.wip_l2_block_mut().metrics.gas += tx_response.gas_used;
    }
}

/// Compares the recomputed effective gas price against the pinned one.
/// Returns whether the tx must be reprocessed; on a deviation beyond the
/// configured maximum the new price is pinned per the opcode rules.
fn compare_tx_effective_gas_price(
    tx: &mut TxTracker,
    new_effective_gas_price: U256,
    tx_gas_price: U256,
    has_gas_price_opcode: bool,
    has_balance_opcode: bool,
    final_deviation_pct: u64,
) -> bool {
    let diff = if tx.effective_gas_price > new_effective_gas_price {
        tx.effective_gas_price - new_effective_gas_price
    } else {
        new_effective_gas_price - tx.effective_gas_price
    };
    let max_deviation =
        tx.effective_gas_price * U256::from(final_deviation_pct) / U256::from(100);
    tx.egp_log.final_deviation = diff;
    tx.egp_log.max_deviation = max_deviation;

    if diff <= max_deviation {
        return false;
    }

    if new_effective_gas_price < tx_gas_price {
        // A tx that read its own gas price or balance would observe the
        // change; bill it at the full gas price instead.
        if has_gas_price_opcode || has_balance_opcode {
            tx.effective_gas_price = tx_gas_price;
        } else {
            tx.effective_gas_price = new_effective_gas_price;
        }
    } else {
        tx.effective_gas_price = tx_gas_price;
        let loss = new_effective_gas_price - tx_gas_price;
        if loss > U256::ZERO {
            warn!(
                event = "egp_loss",
                tx = %tx.hash,
                gas_price = %tx_gas_price,
                effective_gas_price = %new_effective_gas_price,
                loss = %loss,
                "fee loss on second effective gas price computation"
            );
        }
    }

    tx.egp_log.reprocess = true;
    true
}

fn append_egp_error(tx: &mut TxTracker, message: &str) {
    match &mut tx.egp_log.error {
        Some(existing) => {
            existing.push_str("; ");
            existing.push_str(message);
        }
        None => tx.egp_log.error = Some(message.to_string()),
    }
}
