//! Results stream consumption
//!
//! The listener reads through [`ResultFeed`]. On Redis this is a consumer group on
//! the results stream: entries stay pending until acknowledged, so anything the
//! listener could not store is read again on the next fetch. Entries left pending
//! by a consumer that went away are moved over with [`ResultFeed::claim_abandoned`].

use async_trait::async_trait;
use redis::RedisResult;
use redis::aio::ConnectionManager;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::MESSAGE_FIELD;
use crate::config::ListenerConfig;
use crate::error::ClientError;

/// One entry read from the results stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub id: String,
    /// `None` when the entry has no `message` field
    pub body: Option<String>,
}

#[async_trait]
pub trait ResultFeed: Send + Sync + 'static {
    /// Create the consumer group if needed
    async fn ensure_group(&self) -> Result<(), ClientError>;

    /// Unacknowledged entries first, then new ones. May block for a bounded time.
    async fn fetch(&self, count: usize) -> Result<Vec<FeedEntry>, ClientError>;

    async fn ack(&self, id: &str) -> Result<(), ClientError>;

    /// Take over up to `count` entries pending under other consumers for at least
    /// `min_idle`. They are returned by the next [`ResultFeed::fetch`].
    async fn claim_abandoned(&self, min_idle: Duration, count: usize) -> Result<usize, ClientError>;

    /// Trim the stream to roughly `max_length` entries, returning how many went
    async fn trim(&self, max_length: usize) -> Result<u64, ClientError>;
}

type StreamReply = Vec<(String, Vec<(String, Vec<(String, String)>)>)>;

/// XPENDING extended form: (id, consumer, idle ms, delivery count)
type PendingReply = Vec<(String, String, u64, u64)>;

/// Consumer group reader for the Redis results stream.
#[derive(Clone)]
pub struct StreamConsumer {
    redis: ConnectionManager,
    config: ListenerConfig,
}

impl StreamConsumer {
    pub fn new(redis: ConnectionManager, config: ListenerConfig) -> Self {
        Self { redis, config }
    }

    pub fn stream_name(&self) -> &str {
        &self.config.stream_name
    }

    async fn read(&self, count: usize, start_id: &str) -> Result<Vec<FeedEntry>, ClientError> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id);

        // Pending reads never block
        if start_id == ">"
            && let Some(timeout) = self.config.blocking_timeout_ms
        {
            cmd.arg("BLOCK").arg(timeout);
        }

        cmd.arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(start_id);

        let result: RedisResult<Option<StreamReply>> = cmd.query_async(&mut conn).await;

        match result {
            Ok(Some(streams)) => Ok(parse_reply(streams)),
            Ok(None) => Ok(vec![]),
            Err(e) if e.code() == Some("NOGROUP") => {
                warn!(
                    stream = %self.config.stream_name,
                    group = %self.config.consumer_group,
                    "Consumer group missing, recreating"
                );
                self.ensure_group().await?;
                Ok(vec![])
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_reply(streams: StreamReply) -> Vec<FeedEntry> {
    streams
        .into_iter()
        .flat_map(|(_stream, entries)| entries)
        .map(|(id, fields)| {
            let body = fields
                .into_iter()
                .find(|(k, _)| k == MESSAGE_FIELD)
                .map(|(_, v)| v);
            FeedEntry { id, body }
        })
        .collect()
}

#[async_trait]
impl ResultFeed for StreamConsumer {
    async fn ensure_group(&self) -> Result<(), ClientError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(
                    stream = %self.config.stream_name,
                    group = %self.config.consumer_group,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(
                    stream = %self.config.stream_name,
                    group = %self.config.consumer_group,
                    "Consumer group already exists"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch(&self, count: usize) -> Result<Vec<FeedEntry>, ClientError> {
        let pending = self.read(count, "0").await?;
        if !pending.is_empty() {
            debug!(count = pending.len(), "Re-reading unacknowledged results");
            return Ok(pending);
        }
        self.read(count, ">").await
    }

    async fn ack(&self, id: &str) -> Result<(), ClientError> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_abandoned(&self, min_idle: Duration, count: usize) -> Result<usize, ClientError> {
        let mut conn = self.redis.clone();
        let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);

        let pending: RedisResult<PendingReply> = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await;

        let pending = match pending {
            Ok(pending) => pending,
            Err(e) if e.code() == Some("NOGROUP") => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let claim_ids: Vec<String> = pending
            .into_iter()
            .filter(|(_, consumer, idle_ms, _)| {
                *consumer != self.config.consumer_id && *idle_ms >= min_idle_ms
            })
            .map(|(id, _, _, _)| id)
            .collect();

        if claim_ids.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg(min_idle_ms);
        for id in &claim_ids {
            cmd.arg(id);
        }
        // Another consumer may have claimed some of them first; XCLAIM skips those
        let claimed: Vec<String> = cmd.arg("JUSTID").query_async(&mut conn).await?;

        if !claimed.is_empty() {
            warn!(
                stream = %self.config.stream_name,
                count = claimed.len(),
                "Claimed abandoned results"
            );
        }
        Ok(claimed.len())
    }

    async fn trim(&self, max_length: usize) -> Result<u64, ClientError> {
        let mut conn = self.redis.clone();
        let removed: u64 = redis::cmd("XTRIM")
            .arg(&self.config.stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_length)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}

struct PendingEntry {
    entry: FeedEntry,
    owner: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct FeedState {
    next_id: u64,
    new: VecDeque<FeedEntry>,
    pending: Vec<PendingEntry>,
    acked: Vec<String>,
}

/// In-process results feed with consumer-group semantics.
///
/// Handles made with [`MemoryResultFeed::with_consumer`] share the same stream and
/// group but read as different consumers.
pub struct MemoryResultFeed {
    state: Arc<Mutex<FeedState>>,
    notify: Arc<Notify>,
    consumer: String,
    block: Duration,
}

impl Default for MemoryResultFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResultFeed {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FeedState::default())),
            notify: Arc::new(Notify::new()),
            consumer: "memory-listener".to_string(),
            block: Duration::from_millis(50),
        }
    }

    /// Another consumer on the same stream and group
    pub fn with_consumer(&self, consumer: impl Into<String>) -> Self {
        Self {
            state: self.state.clone(),
            notify: self.notify.clone(),
            consumer: consumer.into(),
            block: self.block,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message body; returns its entry id
    pub fn push(&self, body: impl Into<String>) -> String {
        self.push_entry(Some(body.into()))
    }

    /// Append an entry without a `message` field
    pub fn push_without_body(&self) -> String {
        self.push_entry(None)
    }

    fn push_entry(&self, body: Option<String>) -> String {
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = format!("{}-0", state.next_id);
            state.new.push_back(FeedEntry {
                id: id.clone(),
                body,
            });
            id
        };
        self.notify.notify_one();
        id
    }

    /// Ids acknowledged so far, in order
    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    /// Delivered but not yet acknowledged, for every consumer
    pub fn pending(&self) -> Vec<String> {
        self.lock().pending.iter().map(|p| p.entry.id.clone()).collect()
    }

    fn take(&self, count: usize) -> Vec<FeedEntry> {
        let mut state = self.lock();
        let own: Vec<FeedEntry> = state
            .pending
            .iter()
            .filter(|p| p.owner == self.consumer)
            .take(count)
            .map(|p| p.entry.clone())
            .collect();
        if !own.is_empty() {
            return own;
        }

        let take = count.min(state.new.len());
        let batch: Vec<FeedEntry> = state.new.drain(..take).collect();
        let now = Instant::now();
        state.pending.extend(batch.iter().cloned().map(|entry| PendingEntry {
            entry,
            owner: self.consumer.clone(),
            delivered_at: now,
        }));
        batch
    }
}

#[async_trait]
impl ResultFeed for MemoryResultFeed {
    async fn ensure_group(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn fetch(&self, count: usize) -> Result<Vec<FeedEntry>, ClientError> {
        let batch = self.take(count);
        if !batch.is_empty() {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(self.block, self.notify.notified()).await;
        Ok(self.take(count))
    }

    async fn ack(&self, id: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        if let Some(pos) = state.pending.iter().position(|p| p.entry.id == id) {
            state.pending.remove(pos);
            state.acked.push(id.to_string());
        }
        Ok(())
    }

    async fn claim_abandoned(&self, min_idle: Duration, count: usize) -> Result<usize, ClientError> {
        let mut state = self.lock();
        let now = Instant::now();
        let mut claimed = 0;
        for pending in state.pending.iter_mut() {
            if claimed == count {
                break;
            }
            if pending.owner != self.consumer && now.duration_since(pending.delivered_at) >= min_idle {
                pending.owner = self.consumer.clone();
                pending.delivered_at = now;
                claimed += 1;
            }
        }
        Ok(claimed)
    }

    async fn trim(&self, _max_length: usize) -> Result<u64, ClientError> {
        let mut state = self.lock();
        let removed = state.acked.len() as u64;
        state.acked.clear();
        Ok(removed)
    }
}
