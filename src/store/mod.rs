use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] ::redis::RedisError),
}

/// Ordered-set + KV storage shared between producers and the processor.
///
/// Multi-key operations (`insert`, `release`) are atomic: both writes land in
/// one batched command or not at all. This is the only synchronization the
/// pool relies on.
#[async_trait]
pub trait TxStore: Send + Sync {
    /// Number of ids in the pool index.
    async fn index_size(&self, pool: &str) -> Result<u64, StoreError>;

    /// All ids in the pool index, ordered by ascending score.
    async fn index_ids(&self, pool: &str) -> Result<Vec<String>, StoreError>;

    /// The id with the minimum score, if any.
    async fn min_score_id(&self, pool: &str) -> Result<Option<String>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Keyed write without expiry (the last-attempt slot never expires).
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Keyed write with a TTL in seconds.
    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: u64,
    ) -> Result<(), StoreError>;

    /// Atomically add the index entry and write the record.
    async fn insert(
        &self,
        pool: &str,
        id: &str,
        score: u64,
        record: Vec<u8>,
        ttl_seconds: u64,
    ) -> Result<(), StoreError>;

    /// Atomically write the record and remove the index entry.
    async fn release(
        &self,
        pool: &str,
        id: &str,
        record: Vec<u8>,
        ttl_seconds: u64,
    ) -> Result<(), StoreError>;

    /// Remove the index entry only; the record lives on until its TTL.
    async fn remove_from_index(&self, pool: &str, id: &str) -> Result<(), StoreError>;
}
