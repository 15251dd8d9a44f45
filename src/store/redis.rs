use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, instrument};
use url::Url;

use super::{StoreError, TxStore};

/// Redis backend: one sorted set per pool plus plain keys for records.
///
/// Holds a `ConnectionManager`, which multiplexes and reconnects on its own;
/// clones are cheap and every operation works on a clone.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    #[instrument(name = "RedisStore::connect", level = "debug", skip_all)]
    pub async fn connect(url: &Url) -> Result<Self, StoreError> {
        let client = redis::Client::open(url.as_str())?;
        let manager = client.get_connection_manager().await?;
        info!("Connected to the record store");
        Ok(Self { manager })
    }
}

#[async_trait]
impl TxStore for RedisStore {
    async fn index_size(&self, pool: &str) -> Result<u64, StoreError> {
        let mut con = self.manager.clone();
        Ok(con.zcard(pool).await?)
    }

    async fn index_ids(&self, pool: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.manager.clone();
        Ok(con.zrange(pool, 0, -1).await?)
    }

    async fn min_score_id(&self, pool: &str) -> Result<Option<String>, StoreError> {
        let mut con = self.manager.clone();
        let head: Vec<String> = con.zrange(pool, 0, 0).await?;
        Ok(head.into_iter().next())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut con = self.manager.clone();
        Ok(con.get(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con.set(key, value).await?;
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con.set_ex(key, value, ttl_seconds).await?;
        Ok(())
    }

    async fn insert(
        &self,
        pool: &str,
        id: &str,
        score: u64,
        record: Vec<u8>,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .zadd(pool, id, score)
            .ignore()
            .set_ex(id, record, ttl_seconds)
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn release(
        &self,
        pool: &str,
        id: &str,
        record: Vec<u8>,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .set_ex(id, record, ttl_seconds)
            .ignore()
            .zrem(pool, id)
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn remove_from_index(&self, pool: &str, id: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con.zrem(pool, id).await?;
        Ok(())
    }
}
