//! Redis Streams backend.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{ClaimBatch, RawEntry, StreamBroker, BACKLOG_START};

/// Broker backed by Redis Streams (XGROUP / XAUTOCLAIM / XREADGROUP / XACK / XADD).
///
/// Non-blocking commands share one managed connection. Each stream gets its own
/// connection for `XREADGROUP ... BLOCK`, so a blocked read never stalls acks,
/// publishes or reads of another topic.
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
    blocking: Mutex<HashMap<String, MultiplexedConnection>>,
}

/// Connection parameters; `username` needs Redis 6 ACLs.
#[derive(Debug, Clone, Default)]
pub struct RedisParams {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisParams {
    pub fn url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(u), Some(p)) => format!("{}:{}@", u, p),
            (None, Some(p)) => format!(":{}@", p),
            (Some(u), None) => format!("{}@", u),
            (None, None) => String::new(),
        };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.db)
    }
}

impl RedisBroker {
    pub async fn connect(params: &RedisParams) -> Result<Self> {
        let client = redis::Client::open(params.url()).context("parsing redis connection info")?;
        let conn = ConnectionManager::new(client.clone()).await
            .with_context(|| format!("connecting to redis at {}:{}", params.host, params.port))?;
        info!(host = %params.host, port = params.port, db = params.db, "redis broker connected");
        Ok(Self { client, conn, blocking: Mutex::new(HashMap::new()) })
    }

    async fn blocking_conn(&self, stream: &str) -> Result<MultiplexedConnection> {
        let mut map = self.blocking.lock().await;
        if let Some(c) = map.get(stream) { return Ok(c.clone()); }
        let c = self.client.get_multiplexed_async_connection().await.context("opening blocking redis connection")?;
        map.insert(stream.to_string(), c.clone());
        Ok(c)
    }

    async fn drop_blocking_conn(&self, stream: &str) {
        self.blocking.lock().await.remove(stream);
    }
}

/// `BLOCK 0` waits forever in Redis; a zero timeout means "poll" here.
fn block_ms(block: Duration) -> usize {
    (block.as_millis() as usize).max(1)
}

fn to_string(v: &redis::Value) -> String {
    redis::from_redis_value::<String>(v).unwrap_or_default()
}

#[async_trait::async_trait]
impl StreamBroker for RedisBroker {
    async fn create_group(&self, stream: &str, group: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        match conn.xgroup_create_mkstream::<_, _, _, ()>(stream, group, "$").await {
            Ok(()) => Ok(true),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_pending(&self, stream: &str, group: &str, consumer: &str, start: &str, count: usize) -> Result<ClaimBatch> {
        let mut conn = self.conn.clone();
        // Reply: [next-cursor, [[id, [k, v, ...]], ...], (redis >= 7) [deleted ids]]
        let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(stream).arg(group).arg(consumer).arg(0).arg(start).arg("COUNT").arg(count)
            .query_async(&mut conn).await?;
        let next = reply.first().map(to_string).unwrap_or_else(|| BACKLOG_START.to_string());
        let claimed: Vec<(String, Vec<String>)> = match reply.get(1) {
            Some(v) => redis::from_redis_value(v).context("decoding XAUTOCLAIM entries")?,
            None => Vec::new(),
        };
        if claimed.is_empty() {
            return Ok(ClaimBatch { next, entries: Vec::new() });
        }

        // Delivery counters live in the pending-entry list.
        let first = &claimed[0].0;
        let last = &claimed[claimed.len() - 1].0;
        let pending: StreamPendingCountReply = conn.xpending_count(stream, group, first, last, claimed.len()).await?;
        let counts: HashMap<String, u64> = pending.ids.into_iter().map(|p| (p.id, p.times_delivered as u64)).collect();

        let entries = claimed
            .into_iter()
            .map(|(id, flat)| {
                let deliveries = counts.get(&id).copied().unwrap_or(1);
                RawEntry { fields: keel_core::fields::pairs(&flat), id, deliveries }
            })
            .collect();
        Ok(ClaimBatch { next, entries })
    }

    async fn read_new(&self, stream: &str, group: &str, consumer: &str, count: usize, block: Duration) -> Result<Vec<RawEntry>> {
        let mut conn = self.blocking_conn(stream).await?;
        let opts = StreamReadOptions::default().group(group, consumer).count(count).block(block_ms(block));
        let reply: Option<StreamReadReply> = match conn.xread_options(&[stream], &[">"], &opts).await {
            Ok(r) => r,
            Err(e) => {
                self.drop_blocking_conn(stream).await;
                return Err(e.into());
            }
        };
        let Some(reply) = reply else { return Ok(Vec::new()); };
        let mut out = Vec::new();
        for key in reply.keys {
            for sid in key.ids {
                let fields = sid.map.iter().map(|(k, v)| (k.clone(), to_string(v))).collect();
                out.push(RawEntry { id: sid.id, fields, deliveries: 1 });
            }
        }
        debug!(stream, count = out.len(), "read new entries");
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }
}
