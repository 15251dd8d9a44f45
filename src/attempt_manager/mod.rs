use ethers::providers::JsonRpcClient;
use ethers::types::Address;
use thiserror::Error;
use tracing::warn;

use crate::attempt::Attempt;
use crate::ethereum::{Eth, EthError};
use crate::store::StoreError;
use crate::transaction::Tx;

pub mod storage;
mod v1;
mod v2;

pub use v1::AttemptManagerV1;
pub use v2::AttemptManagerV2;

#[derive(Debug, Error)]
#[error("current attempt is not set")]
pub struct NoCurrentAttemptError;

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Eth(#[from] EthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    NoCurrentAttempt(#[from] NoCurrentAttemptError),
}

/// The two pricing policies behind one contract. The processor is agnostic;
/// the variant is picked at boot from the node's capabilities.
pub enum AttemptManager<P: JsonRpcClient> {
    Legacy(AttemptManagerV1<P>),
    Eip1559(AttemptManagerV2<P>),
}

impl<P: JsonRpcClient + 'static> AttemptManager<P> {
    pub fn current(&self) -> Option<&Attempt> {
        match self {
            Self::Legacy(manager) => manager.current(),
            Self::Eip1559(manager) => manager.current(),
        }
    }

    /// Load the last persisted attempt; called once at startup for recovery.
    pub async fn fetch(&mut self) -> Result<(), StoreError> {
        match self {
            Self::Legacy(manager) => manager.fetch().await,
            Self::Eip1559(manager) => manager.fetch().await,
        }
    }

    /// Persist the current attempt. No-op when nothing was made yet.
    pub async fn save(&self) -> Result<(), StoreError> {
        match self {
            Self::Legacy(manager) => manager.save().await,
            Self::Eip1559(manager) => manager.save().await,
        }
    }

    /// Compute the next attempt for `tx`, assigning nonce, fee and gas
    /// in place.
    pub async fn make(&mut self, tx: &mut Tx) -> Result<(), AttemptError> {
        match self {
            Self::Legacy(manager) => manager.make(tx).await,
            Self::Eip1559(manager) => manager.make(tx).await,
        }
    }

    /// Minimal fee adjustment after `replacement transaction underpriced`;
    /// does not advance the attempt index.
    pub async fn replace(&mut self, tx: &mut Tx, replace_attempt: u32) -> Result<(), AttemptError> {
        match self {
            Self::Legacy(manager) => manager.replace(tx, replace_attempt),
            Self::Eip1559(manager) => manager.replace(tx, replace_attempt),
        }
    }
}

/// Receipt-wait window: quadratic in the attempt index.
pub(crate) fn next_waiting_time(base_waiting_time: u64, index: u32) -> u64 {
    base_waiting_time + 10 * u64::from(index).pow(2)
}

/// Final gas for the attempt: the estimate, unless a larger static hint was
/// supplied. A dominating hint must still fit the balance at the attempt's
/// fee cap, otherwise it silently falls back to the estimate.
pub(crate) async fn resolve_gas<P: JsonRpcClient + 'static>(
    eth: &Eth<P>,
    source: Address,
    tx: &Tx,
    fee_cap: u128,
) -> Result<u64, EthError> {
    let estimated = eth.calculate_gas(tx).await?;
    let hint = tx.gas.unwrap_or(0);
    if hint <= estimated {
        return Ok(estimated);
    }

    let balance = eth.balance(source).await?;
    let required = u128::from(hint) * fee_cap + tx.value;
    if required > balance {
        warn!(
            tx_id = %tx.tx_id,
            hint,
            estimated,
            balance,
            "Static gas hint does not fit the balance, using the estimate"
        );
        return Ok(estimated);
    }
    Ok(hint)
}
