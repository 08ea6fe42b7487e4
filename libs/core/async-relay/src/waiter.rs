//! Wait facade
//!
//! Makes a dispatched request look synchronous by polling the result store until a
//! terminal record shows up or the deadline passes.
//!
//! Each outstanding wait costs one store read per `poll_interval` and adds up to one
//! interval of latency. The semaphore caps the read rate at
//! `max_concurrent / poll_interval`.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::WaitConfig;
use crate::envelope::ResultRecord;
use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use crate::result_store::ResultStore;
use crate::store::expiry_from;

#[derive(Clone)]
pub struct WaitFacade {
    results: ResultStore,
    config: WaitConfig,
    permits: Arc<Semaphore>,
}

impl WaitFacade {
    pub fn new(results: ResultStore, config: WaitConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            results,
            config,
            permits,
        }
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    /// [`WaitFacade::wait_for`] with the configured deadline and poll interval
    pub async fn wait(&self, correlation_id: &str) -> Result<Value, RelayError> {
        self.wait_for(correlation_id, self.config.max_wait, self.config.poll_interval)
            .await
    }

    /// Poll until the request reaches a terminal state.
    ///
    /// - `completed` → the data, and the record is deleted
    /// - `failed` → `OperationFailed` with the worker's text, and the record is deleted
    /// - nothing terminal by `max_wait` → `Timeout`; the record is left to its TTL
    ///
    /// Time spent waiting for a concurrency permit counts against `max_wait`.
    #[instrument(skip(self), fields(max_wait_ms = max_wait.as_millis() as u64))]
    pub async fn wait_for(
        &self,
        correlation_id: &str,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<Value, RelayError> {
        let started = Instant::now();
        let deadline = expiry_from(started, max_wait);
        let poll_interval = poll_interval.max(Duration::from_millis(1));

        let timeout = || RelayError::Timeout {
            correlation_id: correlation_id.to_string(),
            waited: max_wait,
        };

        let _permit = match tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => {
                warn!("No wait slot available before the deadline");
                RelayMetrics::wait_finished("timeout", started.elapsed());
                return Err(timeout());
            }
        };
        RelayMetrics::waits_in_flight(self.in_flight());

        let result = loop {
            if let Some(outcome) = self.poll_once(correlation_id).await? {
                break outcome;
            }

            let now = Instant::now();
            if now >= deadline {
                RelayMetrics::wait_finished("timeout", started.elapsed());
                debug!("Timed out waiting for result");
                return Err(timeout());
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        };

        let elapsed = started.elapsed();
        match result {
            Ok(data) => {
                RelayMetrics::wait_finished("completed", elapsed);
                Ok(data)
            }
            Err(message) => {
                RelayMetrics::wait_finished("failed", elapsed);
                Err(RelayError::OperationFailed {
                    correlation_id: correlation_id.to_string(),
                    message,
                })
            }
        }
    }

    /// One read. `Some` once the record is terminal (and consumed).
    async fn poll_once(&self, correlation_id: &str) -> Result<Option<Result<Value, String>>, RelayError> {
        let Some(record) = self.results.get(correlation_id).await? else {
            return Ok(None);
        };
        let Some(outcome) = record.into_outcome() else {
            return Ok(None);
        };

        if let Err(e) = self.results.delete(correlation_id).await {
            warn!(error = %e, "Failed to delete consumed result, leaving it to expire");
        }
        Ok(Some(outcome))
    }

    /// Current record without waiting, for "poll later" callers
    pub async fn status(&self, correlation_id: &str) -> Result<Option<ResultRecord>, RelayError> {
        self.results.get(correlation_id).await
    }

    fn in_flight(&self) -> usize {
        self.config
            .max_concurrent
            .max(1)
            .saturating_sub(self.permits.available_permits())
    }
}
