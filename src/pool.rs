use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::store::{StoreError, TxStore};
use crate::transaction::{InvalidFormatError, Tx};

/// Name of the sorted set holding pending transaction ids.
pub const POOL_NAME: &str = "transactions";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    InvalidFormat(#[from] InvalidFormatError),
    #[error("pool is at capacity ({0})")]
    CapacityExceeded(u64),
}

/// Prioritized pending-transaction pool over the shared store.
///
/// The index orders ids by score (lower = sooner); records live next to it
/// under their own keys with a TTL so producers can read final states after
/// release.
#[derive(Clone)]
pub struct TxPool {
    store: Arc<dyn TxStore>,
    name: String,
    record_ttl: u64,
    max_cap: u64,
}

impl TxPool {
    pub fn new(store: Arc<dyn TxStore>, config: &Config) -> Self {
        Self {
            store,
            name: POOL_NAME.to_string(),
            record_ttl: config.txrecord_expiration,
            max_cap: config.max_tx_cap,
        }
    }

    pub async fn size(&self) -> Result<u64, PoolError> {
        Ok(self.store.index_size(&self.name).await?)
    }

    /// Ids currently queued, best first. Introspection and logging only.
    pub async fn to_list(&self) -> Result<Vec<String>, PoolError> {
        Ok(self.store.index_ids(&self.name).await?)
    }

    pub async fn get(&self, tx_id: &str) -> Result<Option<Tx>, PoolError> {
        let Some(record) = self.store.get(tx_id).await? else {
            return Ok(None);
        };
        Ok(Some(Tx::from_bytes(tx_id, &record)?))
    }

    pub async fn get_next_id(&self) -> Result<Option<String>, PoolError> {
        Ok(self.store.min_score_id(&self.name).await?)
    }

    /// Pop the best-scored decodable transaction, shedding malformed or
    /// expired entries from the index along the way. Never blocks.
    pub async fn fetch_next(&self) -> Result<Option<Tx>, PoolError> {
        loop {
            let Some(tx_id) = self.get_next_id().await? else {
                return Ok(None);
            };
            match self.get(&tx_id).await {
                Ok(Some(tx)) => return Ok(Some(tx)),
                Ok(None) => {
                    warn!(%tx_id, "Record is gone, removing from the index");
                    self.drop_from_index(&tx_id).await?;
                }
                Err(PoolError::InvalidFormat(err)) => {
                    error!(%tx_id, %err, "Malformed record, removing from the index");
                    self.drop_from_index(&tx_id).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Update the record; the index entry is untouched.
    pub async fn save(&self, tx: &Tx) -> Result<(), PoolError> {
        self.store
            .set_with_ttl(&tx.tx_id, tx.to_bytes()?, self.record_ttl)
            .await?;
        Ok(())
    }

    /// Write the final record and remove the tx from the index, atomically.
    pub async fn release(&self, tx: &Tx) -> Result<(), PoolError> {
        info!(tx_id = %tx.tx_id, status = %tx.status, "Releasing transaction");
        self.store
            .release(&self.name, &tx.tx_id, tx.to_bytes()?, self.record_ttl)
            .await?;
        Ok(())
    }

    pub async fn drop_from_index(&self, tx_id: &str) -> Result<(), PoolError> {
        self.store.remove_from_index(&self.name, tx_id).await?;
        Ok(())
    }

    /// Enqueue a new transaction: index entry + record in one batch.
    pub async fn add(&self, tx: &Tx) -> Result<(), PoolError> {
        let size = self.size().await?;
        if size >= self.max_cap {
            warn!(tx_id = %tx.tx_id, size, "Pool is full, refusing transaction");
            return Err(PoolError::CapacityExceeded(self.max_cap));
        }
        self.store
            .insert(
                &self.name,
                &tx.tx_id,
                tx.score,
                tx.to_bytes()?,
                self.record_ttl,
            )
            .await?;
        Ok(())
    }
}
