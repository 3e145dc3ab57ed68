//! Keel stream transport: durable, at-least-once delivery over named topics
//! with consumer-group semantics, plus status publication.
//!
//! The broker itself sits behind [`StreamBroker`]; [`RedisBroker`] talks to
//! Redis Streams and [`MemoryBroker`] keeps the same bookkeeping in process.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use keel_core::{Fields, StatusEvent, WireEvent};
use metrics::counter;
use tracing::{debug, info, warn};

mod memory;
mod redis_broker;

pub use crate::memory::MemoryBroker;
pub use crate::redis_broker::{RedisBroker, RedisParams};

/// Cursor that claims the whole pending backlog from the start.
pub const BACKLOG_START: &str = "0-0";

/// An entry as stored on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub id: String,
    pub fields: Fields,
    /// Times this entry has been handed to a consumer of the group, this delivery included.
    pub deliveries: u64,
}

/// One batch of pending entries claimed from a group.
#[derive(Debug, Clone, Default)]
pub struct ClaimBatch {
    /// Where the next claim should start; [`BACKLOG_START`] once the scan wrapped.
    pub next: String,
    pub entries: Vec<RawEntry>,
}

/// Broker operations the transport needs. One implementation per backend.
#[async_trait::async_trait]
pub trait StreamBroker: Send + Sync {
    /// Create `group` on `stream` positioned at "only new entries", creating the
    /// stream if needed. Returns `false` when the group already existed.
    async fn create_group(&self, stream: &str, group: &str) -> Result<bool>;

    /// Claim up to `count` pending entries of `group` (any owner) starting at `start`.
    async fn claim_pending(&self, stream: &str, group: &str, consumer: &str, start: &str, count: usize) -> Result<ClaimBatch>;

    /// Read up to `count` never-delivered entries, waiting at most `block` for one to arrive.
    /// A zero `block` returns promptly; it never waits indefinitely.
    async fn read_new(&self, stream: &str, group: &str, consumer: &str, count: usize, block: Duration) -> Result<Vec<RawEntry>>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// Append an entry; returns its id.
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String>;
}

/// A delivered entry handed to a [`StreamHandler`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub stream: String,
    pub entry: RawEntry,
}

impl Delivery {
    pub fn id(&self) -> &str { &self.entry.id }
    pub fn deliveries(&self) -> u64 { self.entry.deliveries }

    pub fn decode<E: WireEvent>(&self) -> Result<E, keel_core::FieldError> {
        E::from_fields(&self.entry.fields)
    }
}

/// Acknowledges one entry for one group. Until invoked the entry stays redeliverable.
#[derive(Clone)]
pub struct AckHandle {
    broker: Arc<dyn StreamBroker>,
    stream: Arc<str>,
    group: Arc<str>,
    id: String,
}

impl AckHandle {
    pub fn new(broker: Arc<dyn StreamBroker>, stream: &str, group: &str, id: &str) -> Self {
        Self { broker, stream: stream.into(), group: group.into(), id: id.to_string() }
    }

    pub fn id(&self) -> &str { &self.id }

    pub async fn ack(&self) -> Result<()> {
        self.broker.ack(&self.stream, &self.group, &self.id).await
            .with_context(|| format!("acking {} on {}/{}", self.id, self.stream, self.group))?;
        counter!("stream_ack_total", 1u64);
        Ok(())
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle").field("stream", &self.stream).field("group", &self.group).field("id", &self.id).finish()
    }
}

/// Receives every delivered entry together with the means to acknowledge it.
///
/// Handlers own the acknowledgment decision: an entry that is never acked is
/// claimed again by the next backlog pass.
#[async_trait::async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery, ack: AckHandle);
}

/// Reader for one topic / consumer-group pair.
pub struct StreamConsumer {
    broker: Arc<dyn StreamBroker>,
    stream: String,
    group: String,
    consumer: String,
    batch: usize,
    block: Duration,
    retry_delay: Duration,
}

impl StreamConsumer {
    pub fn new(broker: Arc<dyn StreamBroker>, stream: &str, group: &str, consumer: &str) -> Self {
        let batch = std::env::var("KEEL_STREAM_BATCH").ok().and_then(|s| s.parse().ok()).unwrap_or(10);
        let block_ms = std::env::var("KEEL_STREAM_BLOCK_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(5_000);
        Self {
            broker,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            batch,
            block: Duration::from_millis(block_ms),
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self { self.batch = batch.max(1); self }
    pub fn with_block(mut self, block: Duration) -> Self { self.block = block; self }
    pub fn with_retry_delay(mut self, delay: Duration) -> Self { self.retry_delay = delay; self }

    pub fn stream(&self) -> &str { &self.stream }
    pub fn group(&self) -> &str { &self.group }

    /// Create the group at "only new entries"; an existing group is not an error.
    pub async fn initialize_group(&self) -> Result<()> {
        let created = self.broker.create_group(&self.stream, &self.group).await
            .with_context(|| format!("creating group {} on {}", self.group, self.stream))?;
        if created {
            info!(stream = %self.stream, group = %self.group, "consumer group created");
        } else {
            debug!(stream = %self.stream, group = %self.group, "consumer group already exists");
        }
        Ok(())
    }

    pub fn ack_handle(&self, id: &str) -> AckHandle {
        AckHandle::new(Arc::clone(&self.broker), &self.stream, &self.group, id)
    }

    pub async fn ack(&self, id: &str) -> Result<()> { self.ack_handle(id).ack().await }

    /// Claim everything currently pending for the group, whoever owned it, and
    /// hand it to `handler`. Stops once a pass yields no further entries.
    /// Transport errors are logged and the same batch is retried.
    pub async fn read_backlog(&self, handler: &dyn StreamHandler) -> usize {
        let mut cursor = BACKLOG_START.to_string();
        let mut total = 0usize;
        loop {
            let batch = match self.broker.claim_pending(&self.stream, &self.group, &self.consumer, &cursor, self.batch).await {
                Ok(b) => b,
                Err(e) => {
                    counter!("stream_errors_total", 1u64);
                    warn!(stream = %self.stream, group = %self.group, error = %e, "backlog claim failed; retrying");
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
            };
            let n = batch.entries.len();
            self.dispatch(batch.entries, handler).await;
            total += n;
            if n == 0 || batch.next == BACKLOG_START { break; }
            cursor = batch.next;
        }
        info!(stream = %self.stream, group = %self.group, recovered = total, "backlog recovery finished");
        total
    }

    /// One blocking read of new entries. Returns how many were dispatched.
    pub async fn poll_live(&self, handler: &dyn StreamHandler) -> Result<usize> {
        let entries = self.broker.read_new(&self.stream, &self.group, &self.consumer, self.batch, self.block).await
            .with_context(|| format!("reading {} as {}/{}", self.stream, self.group, self.consumer))?;
        let n = entries.len();
        self.dispatch(entries, handler).await;
        Ok(n)
    }

    /// Read new entries forever. Never returns; transport errors are logged and retried.
    pub async fn read_live(&self, handler: &dyn StreamHandler) {
        info!(stream = %self.stream, group = %self.group, consumer = %self.consumer, "live read started");
        loop {
            if let Err(e) = self.poll_live(handler).await {
                counter!("stream_errors_total", 1u64);
                warn!(error = %e, "live read failed; retrying");
                tokio::time::sleep(self.retry_delay).await;
            }
        }
    }

    async fn dispatch(&self, entries: Vec<RawEntry>, handler: &dyn StreamHandler) {
        for entry in entries {
            counter!("stream_delivered_total", 1u64);
            let ack = self.ack_handle(&entry.id);
            handler.handle(Delivery { stream: self.stream.clone(), entry }, ack).await;
        }
    }
}

/// Append `event` to `topic` as flat string fields.
pub async fn publish<E: WireEvent>(broker: &dyn StreamBroker, topic: &str, event: &E) -> Result<String> {
    let id = broker.append(topic, &event.to_fields()).await.with_context(|| format!("publishing to {}", topic))?;
    counter!("stream_published_total", 1u64);
    Ok(id)
}

/// Reports workload outcomes on the container-status topic.
#[derive(Clone)]
pub struct StatusProducer {
    broker: Arc<dyn StreamBroker>,
    topic: String,
}

impl StatusProducer {
    pub fn new(broker: Arc<dyn StreamBroker>, topic: &str) -> Self {
        Self { broker, topic: topic.to_string() }
    }

    pub async fn publish(&self, event: &StatusEvent) -> Result<String> {
        debug!(topic = %self.topic, kind = %event.kind, project = %event.project_id, "publishing status");
        publish(self.broker.as_ref(), &self.topic, event).await
    }
}
