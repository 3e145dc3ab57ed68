//! In-process broker with consumer-group bookkeeping (cursor, pending-entry
//! list, delivery counters). Used by tests and local runs without Redis.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use keel_core::Fields;
use tokio::sync::Notify;

use crate::{ClaimBatch, RawEntry, StreamBroker, BACKLOG_START};

#[derive(Default)]
struct Pending {
    consumer: String,
    deliveries: u64,
}

#[derive(Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Default)]
struct Topic {
    entries: BTreeMap<u64, Fields>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Topic>>,
    seq: std::sync::atomic::AtomicU64,
    appended: Notify,
}

fn format_id(seq: u64) -> String { format!("{}-0", seq) }

fn parse_id(id: &str) -> Result<u64> {
    let ms = id.split('-').next().unwrap_or("");
    ms.parse::<u64>().map_err(|_| anyhow!("invalid entry id: {}", id))
}

impl MemoryBroker {
    pub fn new() -> Self { Self::default() }

    /// Ids currently pending (delivered, not acked) for `group`, oldest first.
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        let topics = self.topics.lock().unwrap();
        topics.get(stream)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.pending.keys().map(|s| format_id(*s)).collect())
            .unwrap_or_default()
    }

    /// All entries ever appended to `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<(String, Fields)> {
        let topics = self.topics.lock().unwrap();
        topics.get(stream)
            .map(|t| t.entries.iter().map(|(s, f)| (format_id(*s), f.clone())).collect())
            .unwrap_or_default()
    }

    fn take_new(&self, stream: &str, group: &str, consumer: &str, count: usize) -> Result<Vec<RawEntry>> {
        let mut topics = self.topics.lock().unwrap();
        let topic = topics.get_mut(stream).ok_or_else(|| anyhow!("NOGROUP no such stream: {}", stream))?;
        let Topic { entries, groups } = topic;
        let g = groups.get_mut(group).ok_or_else(|| anyhow!("NOGROUP no such group: {}", group))?;
        let mut out = Vec::new();
        for (seq, fields) in entries.range(g.last_delivered + 1..).take(count) {
            g.pending.insert(*seq, Pending { consumer: consumer.to_string(), deliveries: 1 });
            out.push(RawEntry { id: format_id(*seq), fields: fields.clone(), deliveries: 1 });
        }
        if let Some(last) = out.last() { g.last_delivered = parse_id(&last.id)?; }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl StreamBroker for MemoryBroker {
    async fn create_group(&self, stream: &str, group: &str) -> Result<bool> {
        let mut topics = self.topics.lock().unwrap();
        let topic = topics.entry(stream.to_string()).or_default();
        if topic.groups.contains_key(group) { return Ok(false); }
        let last = topic.entries.keys().next_back().copied().unwrap_or(0);
        topic.groups.insert(group.to_string(), Group { last_delivered: last, pending: BTreeMap::new() });
        Ok(true)
    }

    async fn claim_pending(&self, stream: &str, group: &str, consumer: &str, start: &str, count: usize) -> Result<ClaimBatch> {
        let start = parse_id(start)?;
        let mut topics = self.topics.lock().unwrap();
        let topic = topics.get_mut(stream).ok_or_else(|| anyhow!("NOGROUP no such stream: {}", stream))?;
        let Topic { entries, groups } = topic;
        let g = groups.get_mut(group).ok_or_else(|| anyhow!("NOGROUP no such group: {}", group))?;
        let mut out = Vec::new();
        let mut next = BACKLOG_START.to_string();
        for (seq, p) in g.pending.range_mut(start..) {
            if out.len() == count {
                next = format_id(*seq);
                break;
            }
            p.consumer = consumer.to_string();
            p.deliveries += 1;
            let fields = entries.get(seq).cloned().unwrap_or_default();
            out.push(RawEntry { id: format_id(*seq), fields, deliveries: p.deliveries });
        }
        Ok(ClaimBatch { next, entries: out })
    }

    async fn read_new(&self, stream: &str, group: &str, consumer: &str, count: usize, block: Duration) -> Result<Vec<RawEntry>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            let out = self.take_new(stream, group, consumer, count)?;
            if !out.is_empty() { return Ok(out); }
            if tokio::time::timeout_at(deadline, notified).await.is_err() { return Ok(Vec::new()); }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let seq = parse_id(id)?;
        let mut topics = self.topics.lock().unwrap();
        if let Some(g) = topics.get_mut(stream).and_then(|t| t.groups.get_mut(group)) {
            g.pending.remove(&seq);
        }
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        {
            let mut topics = self.topics.lock().unwrap();
            topics.entry(stream.to_string()).or_default().entries.insert(seq, fields.to_vec());
        }
        self.appended.notify_waiters();
        Ok(format_id(seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(k: &str, v: &str) -> Fields { vec![(k.to_string(), v.to_string())] }

    #[tokio::test]
    async fn group_created_at_dollar_skips_existing_entries() {
        let b = MemoryBroker::new();
        b.append("t", &f("a", "1")).await.unwrap();
        assert!(b.create_group("t", "g").await.unwrap());
        assert!(!b.create_group("t", "g").await.unwrap());
        let got = b.read_new("t", "g", "c", 10, Duration::ZERO).await.unwrap();
        assert!(got.is_empty());
        b.append("t", &f("a", "2")).await.unwrap();
        let got = b.read_new("t", "g", "c", 10, Duration::ZERO).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].fields, f("a", "2"));
    }

    #[tokio::test]
    async fn claim_counts_deliveries_and_pages() {
        let b = MemoryBroker::new();
        b.create_group("t", "g").await.unwrap();
        for i in 0..3 { b.append("t", &f("i", &i.to_string())).await.unwrap(); }
        b.read_new("t", "g", "c1", 10, Duration::ZERO).await.unwrap();

        let first = b.claim_pending("t", "g", "c2", BACKLOG_START, 2).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.entries[0].deliveries, 2);
        assert_eq!(first.next, "3-0");
        let second = b.claim_pending("t", "g", "c2", &first.next, 2).await.unwrap();
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.next, BACKLOG_START);

        b.ack("t", "g", "2-0").await.unwrap();
        assert_eq!(b.pending_ids("t", "g"), vec!["1-0", "3-0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn read_new_wakes_on_append() {
        let b = std::sync::Arc::new(MemoryBroker::new());
        b.create_group("t", "g").await.unwrap();
        let reader = {
            let b = b.clone();
            tokio::spawn(async move { b.read_new("t", "g", "c", 10, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        b.append("t", &f("x", "y")).await.unwrap();
        let got = reader.await.unwrap().unwrap();
        assert_eq!(got.len(), 1);
    }
}
