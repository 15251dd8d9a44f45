use std::sync::Arc;

use tracing::error;

use crate::attempt::Attempt;
use crate::store::{StoreError, TxStore};

/// Key of the single-slot last-attempt record. Never expires.
pub const LAST_ATTEMPT_KEY: &str = "last_attempt";

/// Handle to the persisted last-attempt slot.
///
/// Single writer, single reader: only the processor touches it. It is an
/// explicit handle passed into the attempt managers rather than shared
/// global state.
#[derive(Clone)]
pub struct AttemptStorage {
    store: Arc<dyn TxStore>,
}

impl AttemptStorage {
    pub fn new(store: Arc<dyn TxStore>) -> Self {
        Self { store }
    }

    /// A malformed slot is tolerated: recovery proceeds as if there were no
    /// prior attempt, which only costs one conservative first attempt.
    pub async fn get(&self) -> Result<Option<Attempt>, StoreError> {
        let Some(raw) = self.store.get(LAST_ATTEMPT_KEY).await? else {
            return Ok(None);
        };
        match Attempt::from_bytes(&raw) {
            Ok(attempt) => Ok(Some(attempt)),
            Err(err) => {
                error!(%err, "Last attempt record is malformed, ignoring it");
                Ok(None)
            }
        }
    }

    pub async fn save(&self, attempt: &Attempt) -> Result<(), StoreError> {
        let bytes = attempt
            .to_bytes()
            .expect("attempt serialization is infallible");
        self.store.set(LAST_ATTEMPT_KEY, bytes).await
    }
}
