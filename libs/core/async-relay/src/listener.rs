//! Result listener
//!
//! Turns results-stream messages into result store writes.
//!
//! Per entry:
//! - `completed` / `failed` → stored (overwriting), then acknowledged
//! - `processing` → acknowledged, nothing stored
//! - malformed → logged and acknowledged; a poison message is never retried
//! - store write failed → left unacknowledged and read again on the next fetch
//!
//! Entries another listener left pending for `claim_idle` are claimed at startup and
//! every `2 * claim_idle` after that.
//!
//! Redelivery rewrites the same record, so handling is idempotent.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::consumer::{FeedEntry, ResultFeed};
use crate::envelope::{ResultMessage, ResultStatus};
use crate::error::{ClientError, RelayError};
use crate::metrics::RelayMetrics;
use crate::result_store::ResultStore;

const MAX_BACKOFF_SECS: u64 = 30;

/// What happened to one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Stored(ResultStatus),
    Ignored(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Non-terminal status
    Processing,
    /// Not a valid result message
    Malformed,
    /// No `message` field on the entry
    MissingBody,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Processing => "processing",
            SkipReason::Malformed => "malformed",
            SkipReason::MissingBody => "missing_body",
        }
    }
}

/// Batch counters, mostly for logs and tests
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub stored: usize,
    pub ignored: usize,
    /// Store failures left for redelivery
    pub deferred: usize,
}

pub struct ResultListener {
    feed: Arc<dyn ResultFeed>,
    results: ResultStore,
    batch_size: usize,
    claim_idle: Duration,
}

impl ResultListener {
    pub fn new(feed: Arc<dyn ResultFeed>, results: ResultStore, batch_size: usize) -> Self {
        Self {
            feed,
            results,
            batch_size: batch_size.max(1),
            claim_idle: Duration::from_secs(30),
        }
    }

    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    /// Take over results abandoned by other listeners; they are handled on the next batch
    pub async fn reclaim(&self) -> Result<usize, ClientError> {
        self.feed.claim_abandoned(self.claim_idle, self.batch_size).await
    }

    async fn reclaim_logged(&self) {
        match self.reclaim().await {
            Ok(0) => {}
            Ok(claimed) => info!(claimed, "Reclaimed abandoned results"),
            Err(e) => warn!(error = %e, "Failed to claim abandoned results"),
        }
    }

    /// Handle one message body.
    ///
    /// `Err` only when the store write failed; the caller must not acknowledge.
    pub async fn handle_message(&self, body: Option<&str>) -> Result<HandleOutcome, RelayError> {
        let Some(body) = body else {
            return Ok(HandleOutcome::Ignored(SkipReason::MissingBody));
        };

        let message = match ResultMessage::parse(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed result message");
                return Ok(HandleOutcome::Ignored(SkipReason::Malformed));
            }
        };

        let correlation_id = message.correlation_id.clone();
        let Some(record) = message.into_record() else {
            debug!(correlation_id = %correlation_id, "Ignoring non-terminal result message");
            return Ok(HandleOutcome::Ignored(SkipReason::Processing));
        };

        let status = record.status();
        self.results.put(&record).await?;
        info!(correlation_id = %correlation_id, status = status.as_str(), "Stored result");
        Ok(HandleOutcome::Stored(status))
    }

    async fn handle_entry(&self, entry: &FeedEntry, stats: &mut BatchStats) -> Result<(), ClientError> {
        match self.handle_message(entry.body.as_deref()).await {
            Ok(HandleOutcome::Stored(status)) => {
                RelayMetrics::result_stored(status.as_str());
                stats.stored += 1;
            }
            Ok(HandleOutcome::Ignored(reason)) => {
                if reason != SkipReason::Processing {
                    warn!(entry_id = %entry.id, reason = reason.as_str(), "Skipping results entry");
                }
                RelayMetrics::result_skipped(reason.as_str());
                stats.ignored += 1;
            }
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Failed to store result, will retry on redelivery");
                stats.deferred += 1;
                return Ok(());
            }
        }

        self.feed.ack(&entry.id).await
    }

    /// Fetch one batch and handle every entry in it.
    ///
    /// Errors are feed errors (read or ack); store failures are counted as deferred.
    pub async fn process_batch(&self) -> Result<BatchStats, ClientError> {
        let entries = self.feed.fetch(self.batch_size).await?;
        let mut stats = BatchStats::default();

        for entry in &entries {
            self.handle_entry(entry, &mut stats).await?;
        }

        if !entries.is_empty() {
            debug!(
                stored = stats.stored,
                ignored = stats.ignored,
                deferred = stats.deferred,
                "Processed results batch"
            );
        }
        Ok(stats)
    }

    /// Consume until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        self.feed
            .ensure_group()
            .await
            .map_err(|e| RelayError::infrastructure("create results consumer group", e))?;

        info!(batch_size = self.batch_size, claim_idle = ?self.claim_idle, "Result listener started");

        self.reclaim_logged().await;
        let claim_every = self.claim_idle.saturating_mul(2).max(Duration::from_millis(1));
        let mut last_claim = Instant::now();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_claim.elapsed() >= claim_every {
                self.reclaim_logged().await;
                last_claim = Instant::now();
            }

            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = self.process_batch() => outcome,
            };

            match outcome {
                Ok(stats) if stats.deferred > 0 => {
                    // The store is struggling; give it the same backoff as a feed error
                    consecutive_errors += 1;
                    self.backoff(consecutive_errors, &mut shutdown).await;
                }
                Ok(_) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Result listener recovered");
                        consecutive_errors = 0;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(error = %e, consecutive_errors, "Results feed error");
                    self.backoff(consecutive_errors, &mut shutdown).await;
                }
            }
        }

        info!("Result listener stopped");
        Ok(())
    }

    async fn backoff(&self, consecutive_errors: u32, shutdown: &mut watch::Receiver<bool>) {
        let backoff = Duration::from_secs(
            2u64.pow(consecutive_errors.min(5).saturating_sub(1))
                .min(MAX_BACKOFF_SECS),
        );
        debug!(backoff_secs = backoff.as_secs(), "Backing off");
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::consumer::MemoryResultFeed;
    use crate::envelope::{ResultRecord, ResultState};
    use crate::resilience::Resilience;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Fixture {
        feed: Arc<MemoryResultFeed>,
        store: Arc<MemoryStore>,
        results: ResultStore,
        listener: ResultListener,
    }

    fn fixture() -> Fixture {
        let feed = Arc::new(MemoryResultFeed::new());
        let store = Arc::new(MemoryStore::new());
        let results = ResultStore::new(
            store.clone(),
            Resilience::new("store", RetryPolicy::none()),
            Duration::from_secs(60),
        );
        let listener = ResultListener::new(feed.clone(), results.clone(), 10);
        Fixture {
            feed,
            store,
            results,
            listener,
        }
    }

    #[tokio::test]
    async fn test_completed_message_is_stored_and_acked() {
        let f = fixture();
        let id = f.feed.push(r#"{"correlationId":"r-1","status":"completed","data":[1,2]}"#);

        let stats = f.listener.process_batch().await.unwrap();
        assert_eq!(stats.stored, 1);
        assert_eq!(f.feed.acked(), vec![id]);

        let record = f.results.get("r-1").await.unwrap().unwrap();
        assert_eq!(record.state(), ResultState::Completed(&json!([1, 2])));
    }

    #[tokio::test]
    async fn test_terminal_write_overwrites_processing_marker() {
        let f = fixture();
        f.results.mark_processing("r-1").await.unwrap();

        let outcome = f
            .listener
            .handle_message(Some(r#"{"correlationId":"r-1","status":"failed","error":"no such person"}"#))
            .await
            .unwrap();

        assert_eq!(outcome, HandleOutcome::Stored(ResultStatus::Failed));
        let record = f.results.get("r-1").await.unwrap().unwrap();
        assert_eq!(record.state(), ResultState::Failed("no such person"));
    }

    #[tokio::test]
    async fn test_processing_and_malformed_are_acked_without_store_write() {
        let f = fixture();
        f.feed.push(r#"{"correlationId":"r-1","status":"processing"}"#);
        f.feed.push("garbage");
        f.feed.push_without_body();

        let stats = f.listener.process_batch().await.unwrap();
        assert_eq!(stats.ignored, 3);
        assert_eq!(f.feed.acked().len(), 3);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let f = fixture();
        let body = r#"{"correlationId":"r-1","status":"completed","data":"x","timestamp":42}"#;

        f.listener.handle_message(Some(body)).await.unwrap();
        let first = f.results.get("r-1").await.unwrap().unwrap();
        f.listener.handle_message(Some(body)).await.unwrap();
        let second = f.results.get("r-1").await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(second, ResultRecord::completed("r-1", json!("x"), 42));
    }

    #[tokio::test]
    async fn test_store_failure_leaves_entry_pending() {
        let f = fixture();
        let id = f.feed.push(r#"{"correlationId":"r-1","status":"completed","data":1}"#);
        f.store.set_available(false);

        let stats = f.listener.process_batch().await.unwrap();
        assert_eq!(stats.deferred, 1);
        assert!(f.feed.acked().is_empty());
        assert_eq!(f.feed.pending(), vec![id.clone()]);

        f.store.set_available(true);
        let stats = f.listener.process_batch().await.unwrap();
        assert_eq!(stats.stored, 1);
        assert_eq!(f.feed.acked(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_abandoned_by_another_listener_are_stored() {
        let f = fixture();
        let id = f.feed.push(r#"{"correlationId":"r-7","status":"completed","data":"late"}"#);

        // Another replica read the entry and died before acknowledging it
        let crashed = f.feed.with_consumer("crashed-replica");
        assert_eq!(crashed.fetch(10).await.unwrap().len(), 1);

        let survivor = ResultListener::new(
            Arc::new(f.feed.with_consumer("survivor")),
            f.results.clone(),
            10,
        )
        .with_claim_idle(Duration::from_secs(5));

        assert_eq!(survivor.process_batch().await.unwrap(), BatchStats::default());
        assert!(!f.results.exists("r-7").await.unwrap());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(survivor.reclaim().await.unwrap(), 1);
        let stats = survivor.process_batch().await.unwrap();

        assert_eq!(stats.stored, 1);
        assert_eq!(f.feed.acked(), vec![id]);
        let record = f.results.get("r-7").await.unwrap().unwrap();
        assert_eq!(record.state(), ResultState::Completed(&json!("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_claims_abandoned_results_periodically() {
        let f = fixture();
        f.feed.push(r#"{"correlationId":"r-8","status":"completed","data":1}"#);
        f.feed.with_consumer("crashed-replica").fetch(10).await.unwrap();

        let listener = ResultListener::new(
            Arc::new(f.feed.with_consumer("survivor")),
            f.results.clone(),
            10,
        )
        .with_claim_idle(Duration::from_secs(1));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { listener.run(rx).await });

        for _ in 0..100 {
            if f.results.exists("r-8").await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(f.results.exists("r-8").await.unwrap());

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let listener = Arc::new(f.listener);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let listener = listener.clone();
            async move { listener.run(rx).await }
        });

        f.feed.push(r#"{"correlationId":"r-9","status":"completed","data":true}"#);
        for _ in 0..100 {
            if f.results.exists("r-9").await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.results.exists("r-9").await.unwrap());

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
