//! Result bridge between the listener and waiting callers
//!
//! One record per correlation id under `async:result:{id}`, always written with the
//! configured TTL so abandoned results disappear on their own.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::envelope::ResultRecord;
use crate::error::RelayError;
use crate::resilience::Resilience;
use crate::store::KeyValueStore;

pub const RESULT_KEY_PREFIX: &str = "async:result:";

pub fn result_key(correlation_id: &str) -> String {
    format!("{}{}", RESULT_KEY_PREFIX, correlation_id)
}

#[derive(Clone)]
pub struct ResultStore {
    store: Arc<dyn KeyValueStore>,
    resilience: Resilience,
    ttl: Duration,
}

impl ResultStore {
    pub fn new(store: Arc<dyn KeyValueStore>, resilience: Resilience, ttl: Duration) -> Self {
        Self {
            store,
            resilience,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Unconditional write; terminal records are last-write-wins
    #[instrument(skip(self, record), fields(correlation_id = %record.correlation_id(), status = record.status().as_str()))]
    pub async fn put(&self, record: &ResultRecord) -> Result<(), RelayError> {
        let key = result_key(record.correlation_id());
        let value = serde_json::to_string(record)?;

        self.resilience
            .execute_with_retry("put_result", || self.store.put(&key, &value, self.ttl))
            .await
            .map_err(|e| RelayError::infrastructure("store result", e))?;

        debug!("Stored result");
        Ok(())
    }

    /// Write the Processing marker unless a record already exists.
    ///
    /// Returns `false` when the listener got there first, so a fast worker's result
    /// is never overwritten by the marker.
    pub async fn mark_processing(&self, correlation_id: &str) -> Result<bool, RelayError> {
        let key = result_key(correlation_id);
        let value = serde_json::to_string(&ResultRecord::processing(correlation_id))?;

        self.resilience
            .execute_with_retry("mark_processing", || {
                self.store.acquire_if_absent(&key, &value, self.ttl)
            })
            .await
            .map_err(|e| RelayError::infrastructure("write processing marker", e))
    }

    pub async fn get(&self, correlation_id: &str) -> Result<Option<ResultRecord>, RelayError> {
        let key = result_key(correlation_id);

        let raw = self
            .resilience
            .execute_with_retry("get_result", || self.store.get(&key))
            .await
            .map_err(|e| RelayError::infrastructure("read result", e))?;

        raw.map(|value| serde_json::from_str(&value).map_err(RelayError::from))
            .transpose()
    }

    pub async fn exists(&self, correlation_id: &str) -> Result<bool, RelayError> {
        let key = result_key(correlation_id);
        self.resilience
            .execute_with_retry("result_exists", || self.store.exists(&key))
            .await
            .map_err(|e| RelayError::infrastructure("check result", e))
    }

    pub async fn delete(&self, correlation_id: &str) -> Result<bool, RelayError> {
        let key = result_key(correlation_id);
        self.resilience
            .execute_with_retry("delete_result", || self.store.delete(&key))
            .await
            .map_err(|e| RelayError::infrastructure("delete result", e))
    }

    /// Push a record's expiry out to `ttl` from now. `false` if the record is gone.
    pub async fn extend(&self, correlation_id: &str, ttl: Duration) -> Result<bool, RelayError> {
        let key = result_key(correlation_id);
        self.resilience
            .execute_with_retry("extend_result", || self.store.expire(&key, ttl))
            .await
            .map_err(|e| RelayError::infrastructure("extend result", e))
    }
}
