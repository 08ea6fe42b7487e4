//! Async Relay
//!
//! Request/reply correlation on top of Redis Streams, for callers that want a
//! synchronous-looking call to a worker that answers asynchronously.
//!
//! ## Features
//!
//! - **Dispatcher**: publishes a request envelope with a fresh correlation id
//! - **Result store**: TTL-bounded records keyed by correlation id
//! - **Result listener**: consumer group on the results stream, writes terminal results
//! - **Wait facade**: polls the store until a terminal record or the deadline
//! - **Distributed lock**: run a job on at most one instance, with lease renewal
//! - **Resilience**: fixed-delay retry for connection errors plus a circuit breaker
//! - **Health gate**: blocks startup until dependencies answer
//!
//! ## Example
//!
//! ```ignore
//! use async_relay::{RelayConfig, RelayContext, RouteTable};
//!
//! let relay = RelayContext::from_redis(redis, RelayConfig::from_env()?, RouteTable::standard());
//! relay.health_gate(vec![]).run().await?;
//! tokio::spawn({
//!     let listener = relay.listener();
//!     async move { listener.run(shutdown_rx).await }
//! });
//!
//! let id = relay.dispatcher.publish("get-all-people", serde_json::Value::Null).await?;
//! let people = relay.waiter.wait(&id).await?;
//! ```

mod broker;
mod config;
mod consumer;
mod context;
mod dispatcher;
mod envelope;
mod error;
mod health;
mod listener;
mod lock;
pub mod metrics;
mod resilience;
mod result_store;
mod routes;
mod store;
mod waiter;

pub use broker::{MemoryBroker, MessageBroker, RedisStreamBroker, ResilientBroker};
pub use config::{
    CircuitBreakerConfig, HealthGateConfig, ListenerConfig, LockConfig, RelayConfig, RetryPolicy, WaitConfig,
};
pub use consumer::{FeedEntry, MemoryResultFeed, ResultFeed, StreamConsumer};
pub use context::RelayContext;
pub use dispatcher::Dispatcher;
pub use envelope::{RequestEnvelope, ResultMessage, ResultRecord, ResultSource, ResultState, ResultStatus};
pub use error::{ClientError, ClientErrorKind, ErrorCategory, RelayError};
pub use health::{
    BrokerProbe, ConnectionHealthState, DependencyStatus, HealthProbe, HealthState, StartupHealthGate, StoreProbe,
    health_router,
};
pub use listener::{BatchStats, HandleOutcome, ResultListener, SkipReason};
pub use lock::{DistributedLock, LockGuard, LockOutcome};
pub use metrics::{RelayMetrics, init_metrics};
pub use resilience::{BreakerPermit, CircuitBreaker, CircuitState, Resilience};
pub use result_store::ResultStore;
pub use routes::{REQUEST_STREAM_PREFIX, RouteTable};
pub use store::{KeyValueStore, MAX_TTL, MemoryStore, RedisStore};
pub use waiter::WaitFacade;
