//! Scheduled maintenance
//!
//! Every instance schedules the same jobs; the distributed lock makes sure only
//! one of them actually runs each tick. Losing the race is routine and logged at
//! debug.

use async_relay::{ClientError, LockOutcome, RelayContext, RelayError, StartupHealthGate};
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::config::JobsConfig;

pub const HEALTH_JOB: &str = "dependency-health";
pub const TRIM_JOB: &str = "results-stream-trim";

/// Re-probe every dependency and refresh the shared health state
pub async fn refresh_dependency_health(
    relay: &RelayContext,
    gate: &StartupHealthGate,
    lock_ttl: Duration,
) -> Result<LockOutcome<bool>, RelayError> {
    relay.lock.run_exclusive(HEALTH_JOB, lock_ttl, || gate.check_all()).await
}

/// Trim the results stream back to its configured length
pub async fn trim_results_stream(
    relay: &RelayContext,
    lock_ttl: Duration,
) -> Result<LockOutcome<Result<u64, ClientError>>, RelayError> {
    let feed = relay.feed();
    let max_length = relay.config.listener.max_length;
    relay
        .lock
        .run_exclusive(TRIM_JOB, lock_ttl, || async move { feed.trim(max_length).await })
        .await
}

fn log_health(outcome: Result<LockOutcome<bool>, RelayError>) {
    match outcome {
        Ok(LockOutcome::Executed(true)) => debug!(job = HEALTH_JOB, "All dependencies reachable"),
        Ok(LockOutcome::Executed(false)) => warn!(job = HEALTH_JOB, "Some dependencies are unreachable"),
        Ok(LockOutcome::Busy) => debug!(job = HEALTH_JOB, "Skipped, running elsewhere"),
        Err(e) => error!(job = HEALTH_JOB, error = %e, "Job could not run"),
    }
}

fn log_trim(outcome: Result<LockOutcome<Result<u64, ClientError>>, RelayError>) {
    match outcome {
        Ok(LockOutcome::Executed(Ok(removed))) => info!(job = TRIM_JOB, removed, "Trimmed results stream"),
        Ok(LockOutcome::Executed(Err(e))) => warn!(job = TRIM_JOB, error = %e, "Trim failed"),
        Ok(LockOutcome::Busy) => debug!(job = TRIM_JOB, "Skipped, running elsewhere"),
        Err(e) => error!(job = TRIM_JOB, error = %e, "Job could not run"),
    }
}

/// Build and start the scheduler. The caller shuts it down.
pub async fn start(relay: &RelayContext, gate: &StartupHealthGate, config: &JobsConfig) -> eyre::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    let lock_ttl = config.lock_ttl;

    let health_job = {
        let relay = relay.clone();
        let gate = gate.clone();
        Job::new_async(config.health_cron.as_str(), move |_uuid, _l| {
            let relay = relay.clone();
            let gate = gate.clone();
            Box::pin(async move {
                log_health(refresh_dependency_health(&relay, &gate, lock_ttl).await);
            })
        })?
    };

    let trim_job = {
        let relay = relay.clone();
        Job::new_async(config.trim_cron.as_str(), move |_uuid, _l| {
            let relay = relay.clone();
            Box::pin(async move {
                log_trim(trim_results_stream(&relay, lock_ttl).await);
            })
        })?
    };

    scheduler.add(health_job).await?;
    scheduler.add(trim_job).await?;
    scheduler.start().await?;

    info!(
        health_cron = %config.health_cron,
        trim_cron = %config.trim_cron,
        "Scheduled maintenance jobs"
    );
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_relay::{MemoryBroker, MemoryResultFeed, MemoryStore, RelayConfig, ResultFeed, RouteTable};
    use std::sync::Arc;

    fn relay(store: Arc<MemoryStore>, feed: Arc<MemoryResultFeed>, instance: &str) -> RelayContext {
        RelayContext::new(
            RelayConfig::new().with_instance_id(instance),
            store,
            Arc::new(MemoryBroker::new()),
            feed,
            RouteTable::standard(),
        )
    }

    #[tokio::test]
    async fn test_trim_runs_under_lock() {
        let feed = Arc::new(MemoryResultFeed::new());
        let relay = relay(Arc::new(MemoryStore::new()), feed.clone(), "a");

        let id = feed.push("{}");
        feed.fetch(10).await.unwrap();
        feed.ack(&id).await.unwrap();

        let outcome = trim_results_stream(&relay, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, LockOutcome::Executed(Ok(1))));
        assert!(!relay.lock.is_locked(TRIM_JOB).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_instance_is_busy() {
        let store = Arc::new(MemoryStore::new());
        let a = relay(store.clone(), Arc::new(MemoryResultFeed::new()), "a");
        let b = relay(store, Arc::new(MemoryResultFeed::new()), "b");

        let held = a.lock.try_acquire(TRIM_JOB, Duration::from_secs(5)).await.unwrap().unwrap();
        let outcome = trim_results_stream(&b, Duration::from_secs(5)).await.unwrap();
        assert!(outcome.is_busy());

        held.release().await.unwrap();
        assert!(!trim_results_stream(&b, Duration::from_secs(5)).await.unwrap().is_busy());
    }

    #[tokio::test]
    async fn test_health_job_refreshes_state() {
        let relay = relay(Arc::new(MemoryStore::new()), Arc::new(MemoryResultFeed::new()), "a");
        let gate = relay.health_gate(vec![]);

        let outcome = refresh_dependency_health(&relay, &gate, Duration::from_secs(5)).await.unwrap();

        assert_eq!(outcome, LockOutcome::Executed(true));
        assert!(relay.health.get("broker").unwrap().reachable);
        assert!(relay.health.get("store").unwrap().reachable);
    }

    #[tokio::test]
    async fn test_scheduler_accepts_default_crons() {
        let relay = relay(Arc::new(MemoryStore::new()), Arc::new(MemoryResultFeed::new()), "a");
        let gate = relay.health_gate(vec![]);

        let mut scheduler = start(&relay, &gate, &JobsConfig::default()).await.unwrap();
        scheduler.shutdown().await.unwrap();
    }
}
