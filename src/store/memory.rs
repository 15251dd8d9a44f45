use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{StoreError, TxStore};

/// In-process store with the same ordering semantics as the Redis backend.
///
/// Used by tests and by tooling that runs without a Redis at hand. TTLs are
/// accepted and ignored; a test never lives long enough to care.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    scores: HashMap<String, u64>,
    records: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ordered_ids(inner: &Inner) -> Vec<String> {
        let mut ids: Vec<(&String, &u64)> = inner.scores.iter().collect();
        // Ties break lexicographically, matching ZRANGE.
        ids.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl TxStore for MemoryStore {
    async fn index_size(&self, _pool: &str) -> Result<u64, StoreError> {
        Ok(self.inner.lock().unwrap().scores.len() as u64)
    }

    async fn index_ids(&self, _pool: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::ordered_ids(&inner))
    }

    async fn min_score_id(&self, _pool: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::ordered_ids(&inner).into_iter().next())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.lock().unwrap().records.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .records
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        _ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        self.set(key, value).await
    }

    async fn insert(
        &self,
        _pool: &str,
        id: &str,
        score: u64,
        record: Vec<u8>,
        _ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.scores.insert(id.to_string(), score);
        inner.records.insert(id.to_string(), record);
        Ok(())
    }

    async fn release(
        &self,
        _pool: &str,
        id: &str,
        record: Vec<u8>,
        _ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.records.insert(id.to_string(), record);
        inner.scores.remove(id);
        Ok(())
    }

    async fn remove_from_index(&self, _pool: &str, id: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap().scores.remove(id);
        Ok(())
    }
}
