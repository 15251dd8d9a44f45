use std::time::Duration;

use chrono::Utc;
use ethers::providers::JsonRpcClient;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::attempt_manager::{AttemptError, AttemptManager};
use crate::config::Config;
use crate::ethereum::{
    is_nonce_too_low, is_replacement_underpriced, rpc_error, Eth, EthError,
};
use crate::pool::{PoolError, TxPool};
use crate::shutdown::Shutdown;
use crate::signer::{is_signer_unreachable, SignerError, TxSigner};
use crate::transaction::{Tx, TxStatus};

use std::sync::Arc;

/// Pool poll interval.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

static TX_SUBMITTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("tx_submitted", "Raw transactions accepted by the node").unwrap()
});

static TX_CONFIRMED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("tx_confirmed", "Transactions confirmed at depth").unwrap()
});

static TX_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("tx_dropped", "Transactions dropped by policy").unwrap()
});

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to send transaction: {0}")]
    Sending(String),

    #[error("signer failure: {0}")]
    Signer(#[from] SignerError),

    #[error("transaction was not mined within {0}s")]
    WaitTimeout(u64),

    #[error("confirmation was not observed")]
    Confirmation,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Attempt(#[from] AttemptError),

    #[error(transparent)]
    Eth(#[from] EthError),
}

/// The single worker draining the pool against one owned account.
///
/// One processor per account: nonce assignment is serialized by
/// construction, and a transaction is carried to a terminal or parked state
/// before the next one is looked at.
pub struct Processor<P: JsonRpcClient> {
    eth: Arc<Eth<P>>,
    pool: TxPool,
    signer: Arc<dyn TxSigner>,
    attempt_manager: AttemptManager<P>,
    config: Config,
}

impl<P: JsonRpcClient + 'static> Processor<P> {
    pub fn new(
        eth: Arc<Eth<P>>,
        pool: TxPool,
        signer: Arc<dyn TxSigner>,
        attempt_manager: AttemptManager<P>,
        config: Config,
    ) -> Self {
        Self {
            eth,
            pool,
            signer,
            attempt_manager,
            config,
        }
    }

    /// Restore the last attempt and poll the pool at 1 Hz until shutdown.
    ///
    /// The shutdown check sits between iterations: a transaction that is
    /// mid-flight is carried to its parked or terminal state first.
    pub async fn run(&mut self, shutdown: Shutdown) -> anyhow::Result<()> {
        self.attempt_manager.fetch().await?;
        if let Some(attempt) = self.attempt_manager.current() {
            info!(
                nonce = attempt.nonce,
                index = attempt.index,
                tx_id = %attempt.tx_id,
                "Recovered last attempt"
            );
        }

        while !shutdown.is_shutting_down() {
            if let Err(err) = self.process_next().await {
                error!(%err, "Transaction processing failed");
                tokio::time::sleep(Duration::from_secs(self.config.restart_timeout)).await;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        info!("Processor stopped");
        Ok(())
    }

    /// One poll iteration: pick the best transaction and drive it.
    pub async fn process_next(&mut self) -> Result<(), ProcessError> {
        let Some(tx) = self.pool.fetch_next().await? else {
            return Ok(());
        };
        info!(tx_id = %tx.tx_id, status = %tx.status, attempts = tx.attempts, "Picked transaction");
        self.acquire(tx).await
    }

    /// Scoped acquisition: the transaction state is written back on every
    /// exit path, and the attempt budget is enforced on both edges.
    async fn acquire(&mut self, mut tx: Tx) -> Result<(), ProcessError> {
        tx.attempts += 1;
        if tx.status == TxStatus::Proposed {
            tx.status = TxStatus::Seen;
        }

        let result = if tx.attempts > self.config.max_resubmit_amount {
            info!(tx_id = %tx.tx_id, attempts = tx.attempts, "Attempt budget exhausted");
            Ok(())
        } else {
            self.process(&mut tx).await
        };

        let result = match result {
            Err(ProcessError::Attempt(AttemptError::Eth(EthError::EstimateGasRevert(reason)))) => {
                // Pre-flight revert. Bridge-originated calls are idempotent
                // re-sends: drop them instead of blocking the queue. Anything
                // else goes back as SEEN for the producer to act on.
                if tx.has_bridge_origin(&self.config.ima_id_suffix) {
                    warn!(tx_id = %tx.tx_id, %reason, "Pre-flight revert on a bridge tx, dropping");
                    tx.status = TxStatus::Dropped;
                } else {
                    warn!(tx_id = %tx.tx_id, %reason, "Pre-flight revert, returning to the pool");
                    tx.status = TxStatus::Seen;
                }
                Ok(())
            }
            other => other,
        };

        if !tx.is_terminal() && tx.attempts > self.config.max_resubmit_amount {
            warn!(tx_id = %tx.tx_id, attempts = tx.attempts, "Dropping transaction past the budget");
            tx.status = TxStatus::Dropped;
        }

        if tx.status == TxStatus::Dropped {
            TX_DROPPED.inc();
        }

        if tx.is_terminal() {
            self.pool.release(&tx).await?;
        } else {
            self.pool.save(&tx).await?;
        }

        result
    }

    /// The send → wait → confirm sequence for one acquired transaction.
    #[instrument(level = "debug", skip_all, fields(tx_id = %tx.tx_id))]
    async fn process(&mut self, tx: &mut Tx) -> Result<(), ProcessError> {
        // A crash between "submit" and "save" leaves a mined hash behind;
        // pick it up instead of resubmitting the nonce.
        if tx.is_sent() {
            for hash in tx.hashes.clone().into_iter().rev() {
                if self.eth.get_status(hash).await? >= 0 {
                    info!(?hash, "Transaction is already mined");
                    tx.status = TxStatus::Mined;
                    return self.confirm(tx).await;
                }
            }
        }

        self.attempt_manager.make(tx).await?;
        let wait_time = self
            .attempt_manager
            .current()
            .map_or(self.config.base_waiting_time + 10, |attempt| {
                attempt.wait_time
            });

        self.send(tx).await?;
        self.wait(tx, wait_time).await?;
        self.confirm(tx).await
    }

    /// Sign and submit, re-pricing in place while the node keeps answering
    /// `replacement transaction underpriced`.
    async fn send(&mut self, tx: &mut Tx) -> Result<(), ProcessError> {
        let mut retry: u32 = 0;
        loop {
            let envelope = self.eth.convert_tx(tx);
            let signature = match self.signer.sign(&envelope).await {
                Ok(signature) => signature,
                Err(err) => {
                    tx.status = TxStatus::Unsent;
                    if is_signer_unreachable(&err) {
                        warn!(tx_id = %tx.tx_id, %err, "Signer is unreachable, parking the transaction");
                    }
                    return Err(err.into());
                }
            };
            let raw = envelope.rlp_signed(&signature);

            match self.eth.send_tx(raw).await {
                Ok(hash) => {
                    info!(tx_id = %tx.tx_id, ?hash, nonce = ?tx.nonce, "Transaction sent");
                    tx.status = TxStatus::Sent;
                    tx.add_hash(hash);
                    tx.sent_ts = Some(Utc::now().timestamp());
                    self.pool.save(tx).await?;
                    // The attempt slot must reflect every on-wire submission,
                    // or a crash here would reuse the (nonce, fee) pair.
                    self.attempt_manager
                        .save()
                        .await
                        .map_err(AttemptError::from)?;
                    TX_SUBMITTED.inc();
                    return Ok(());
                }
                Err(EthError::Rpc(provider_err)) => {
                    if let Some(rpc) = rpc_error(&provider_err) {
                        if is_replacement_underpriced(rpc) {
                            if retry >= self.config.underpriced_retries {
                                tx.status = TxStatus::Unsent;
                                return Err(ProcessError::Sending(
                                    "underpriced retries exhausted".to_string(),
                                ));
                            }
                            warn!(tx_id = %tx.tx_id, retry, "Replacement underpriced, bumping the fee");
                            self.attempt_manager.replace(tx, retry).await?;
                            retry += 1;
                            continue;
                        }
                        if is_nonce_too_low(rpc) {
                            info!(tx_id = %tx.tx_id, "Nonce too low, will recompute on the next attempt");
                        }
                    }
                    tx.status = TxStatus::Unsent;
                    return Err(ProcessError::Sending(provider_err.to_string()));
                }
                Err(err) => {
                    tx.status = TxStatus::Unsent;
                    return Err(ProcessError::Sending(err.to_string()));
                }
            }
        }
    }

    /// Poll for the receipt within the attempt's window.
    async fn wait(&mut self, tx: &mut Tx, wait_time: u64) -> Result<(), ProcessError> {
        let Some(hash) = tx.tx_hash else {
            return Ok(());
        };
        match self
            .eth
            .wait_for_receipt(hash, Duration::from_secs(wait_time))
            .await
        {
            Ok(_status) => {
                info!(tx_id = %tx.tx_id, ?hash, "Transaction mined");
                tx.status = TxStatus::Mined;
                Ok(())
            }
            Err(EthError::ReceiptTimeout { .. }) => {
                info!(tx_id = %tx.tx_id, wait_time, "Not mined within the window");
                tx.status = TxStatus::Timeout;
                Err(ProcessError::WaitTimeout(wait_time))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Block for the confirmation depth, then settle the final status over
    /// every historical hash: a later resubmission may have won the slot.
    async fn confirm(&mut self, tx: &mut Tx) -> Result<(), ProcessError> {
        match self
            .eth
            .wait_for_blocks(
                self.config.confirmation_blocks,
                Duration::from_secs(self.config.max_waiting_time),
            )
            .await
        {
            Ok(()) => {}
            Err(EthError::BlockTimeout { .. }) => {
                tx.status = TxStatus::Unconfirmed;
                return Err(ProcessError::Confirmation);
            }
            Err(err) => return Err(err.into()),
        }

        for hash in tx.hashes.clone().into_iter().rev() {
            let status = self.eth.get_status(hash).await?;
            if status >= 0 {
                tx.set_as_completed(status == 1);
                info!(tx_id = %tx.tx_id, ?hash, status = %tx.status, "Transaction confirmed");
                TX_CONFIRMED.inc();
                return Ok(());
            }
        }

        tx.status = TxStatus::Unconfirmed;
        Err(ProcessError::Confirmation)
    }
}
