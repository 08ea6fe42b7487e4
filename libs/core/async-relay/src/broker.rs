//! Request publishing
//!
//! [`MessageBroker`] is the client adapter seam: it reports failures as
//! [`ClientError`] with a structured kind. [`ResilientBroker`] adds retries and the
//! circuit breaker on top and exposes the health probe.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::resilience::{CircuitState, Resilience};

/// Stream entry field holding the JSON body
pub const MESSAGE_FIELD: &str = "message";

#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Append `body` to `stream`, returning the broker's message id
    async fn publish(&self, stream: &str, body: &str) -> Result<String, ClientError>;

    async fn ping(&self) -> Result<(), ClientError>;
}

/// Redis Streams publisher (XADD with approximate trimming).
#[derive(Clone)]
pub struct RedisStreamBroker {
    redis: ConnectionManager,
    max_length: usize,
}

impl RedisStreamBroker {
    pub fn new(redis: ConnectionManager, max_length: usize) -> Self {
        Self { redis, max_length }
    }
}

#[async_trait]
impl MessageBroker for RedisStreamBroker {
    async fn publish(&self, stream: &str, body: &str) -> Result<String, ClientError> {
        let mut conn = self.redis.clone();

        let message_id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(MESSAGE_FIELD)
            .arg(body)
            .query_async(&mut conn)
            .await?;

        debug!(stream = %stream, message_id = %message_id, "Published message");
        Ok(message_id)
    }

    async fn ping(&self) -> Result<(), ClientError> {
        let mut conn = self.redis.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(ClientError::rejected(format!("unexpected PING reply: {}", reply)))
        }
    }
}

/// Broker wrapped with retry classification and a circuit breaker.
#[derive(Clone)]
pub struct ResilientBroker {
    broker: Arc<dyn MessageBroker>,
    resilience: Resilience,
}

impl ResilientBroker {
    pub fn new(broker: Arc<dyn MessageBroker>, resilience: Resilience) -> Self {
        Self { broker, resilience }
    }

    pub async fn publish_with_retry(&self, stream: &str, body: &str) -> Result<String, ClientError> {
        self.resilience
            .execute_with_retry("publish", || self.broker.publish(stream, body))
            .await
    }

    /// Single PING, no retries
    pub async fn is_healthy(&self) -> bool {
        match self.broker.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Broker health check failed");
                false
            }
        }
    }

    /// PING with the error preserved, for callers that report why
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.broker.ping().await
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.resilience.circuit_state()
    }
}

/// In-process broker that records what was published.
///
/// `fail_next` makes the next n publishes fail with a connection error.
#[derive(Default)]
pub struct MemoryBroker {
    published: Mutex<Vec<(String, String)>>,
    failures_left: AtomicU32,
    unavailable: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// (stream, body) pairs in publish order
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, stream: &str, body: &str) -> Result<String, ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClientError::connection("memory broker is unavailable"));
        }
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ClientError::connection("injected publish failure"));
        }

        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        published.push((stream.to_string(), body.to_string()));
        Ok(format!("{}-0", published.len()))
    }

    async fn ping(&self) -> Result<(), ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ClientError::connection("memory broker is unavailable"))
        } else {
            Ok(())
        }
    }
}
