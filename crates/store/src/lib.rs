//! Keel store: per-project collapsing queue between the stream and the processor.
//!
//! At-least-once delivery and bursty retries produce duplicate or conflicting
//! intents for the same project. The queue keeps at most one entry per project
//! and acknowledges whatever it supersedes, so only the surviving intent ever
//! reaches the cluster.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use keel_core::{EventKind, StreamEvent};
use keel_stream::AckHandle;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// A queued event together with the acknowledgment of its stream entry.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub event: StreamEvent,
    pub ack: AckHandle,
    /// Times the stream entry has been delivered, this delivery included.
    pub deliveries: u64,
}

impl QueueEntry {
    pub fn new(event: StreamEvent, ack: AckHandle) -> Self { Self { event, ack, deliveries: 1 } }

    pub fn with_deliveries(mut self, n: u64) -> Self {
        self.deliveries = n;
        self
    }
}

/// How an incoming event of a different kind interacts with a queued one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollapsePolicy {
    /// A queued CREATED survives a later DELETED/REQUESTED for the same project,
    /// which is acked and dropped. An incoming CREATED replaces anything queued.
    /// A dropped DELETED leaves the workload running.
    #[default]
    CreatedWins,
    /// The most recent event always replaces the queued one.
    LatestWins,
}

impl std::str::FromStr for CollapsePolicy {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created-wins" => Ok(Self::CreatedWins),
            "latest-wins" => Ok(Self::LatestWins),
            other => Err(anyhow::anyhow!("unknown collapse policy: {} (expect created-wins or latest-wins)", other)),
        }
    }
}

/// What happened to an offered entry.
#[derive(Debug)]
pub enum Offer {
    /// Appended at the back.
    Queued,
    /// Took the place of a queued entry, which is returned for acking.
    Replaced(QueueEntry),
    /// Not queued; the incoming entry is returned for acking.
    Dropped(QueueEntry),
}

impl Offer {
    /// The entry whose stream message must be acknowledged now, if any.
    pub fn into_ackable(self) -> Option<QueueEntry> {
        match self {
            Offer::Queued => None,
            Offer::Replaced(e) | Offer::Dropped(e) => Some(e),
        }
    }
}

/// Collapsing queue keyed by project id with FIFO order.
///
/// `order` may hold stale slots for projects that were popped or purged; a
/// slot is live only while its generation matches the one stored in `map`.
pub struct CollapsingQueue {
    map: FxHashMap<String, (u64, QueueEntry)>,
    order: VecDeque<(String, u64)>,
    next_gen: u64,
    policy: CollapsePolicy,
    superseded: u64,
}

impl Default for CollapsingQueue {
    fn default() -> Self { Self::with_policy(CollapsePolicy::default()) }
}

impl CollapsingQueue {
    pub fn with_policy(policy: CollapsePolicy) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), next_gen: 0, policy, superseded: 0 }
    }

    pub fn policy(&self) -> CollapsePolicy { self.policy }
    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    /// Entries acknowledged without processing so far.
    pub fn superseded(&self) -> u64 { self.superseded }

    pub fn queued_kind(&self, project_id: &str) -> Option<&EventKind> {
        self.map.get(project_id).map(|(_, e)| &e.event.kind)
    }

    pub fn push(&mut self, entry: QueueEntry) -> Offer {
        let project = entry.event.project_id.clone();
        let Some((_, queued)) = self.map.get_mut(&project) else {
            let gen = self.next_gen;
            self.next_gen += 1;
            self.order.push_back((project.clone(), gen));
            self.map.insert(project, (gen, entry));
            return Offer::Queued;
        };

        let replace = queued.event.kind == entry.event.kind
            || entry.event.kind == EventKind::Created
            || self.policy == CollapsePolicy::LatestWins;
        self.superseded += 1;
        if replace {
            let old = std::mem::replace(queued, entry);
            Offer::Replaced(old)
        } else {
            Offer::Dropped(entry)
        }
    }

    /// Remove and return the oldest queued entry.
    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        while let Some((project, gen)) = self.order.pop_front() {
            let live = matches!(self.map.get(&project), Some((g, _)) if *g == gen);
            if live { return self.map.remove(&project).map(|(_, e)| e); }
        }
        None
    }

    /// Purge every pending entry for `project_id` without processing it.
    pub fn remove_project_entries(&mut self, project_id: &str) -> Vec<QueueEntry> {
        let out: Vec<QueueEntry> = self.map.remove(project_id).map(|(_, e)| e).into_iter().collect();
        self.superseded += out.len() as u64;
        out
    }
}

/// Queue handle shared by the ingest tasks and the processor loop.
///
/// The lock is only held for the in-memory mutation; acknowledgments of
/// superseded entries happen after it is released.
#[derive(Clone, Default)]
pub struct SharedQueue {
    inner: Arc<Mutex<CollapsingQueue>>,
}

impl SharedQueue {
    pub fn new(policy: CollapsePolicy) -> Self {
        Self { inner: Arc::new(Mutex::new(CollapsingQueue::with_policy(policy))) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CollapsingQueue> {
        // The queue holds no invariants a panicking holder could break halfway.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    /// Offer an entry and ack whatever it superseded.
    pub async fn offer(&self, entry: QueueEntry) {
        let (offer, depth) = {
            let mut q = self.lock();
            let o = q.push(entry);
            (o, q.len())
        };
        gauge!("queue_depth", depth as f64);
        match &offer {
            Offer::Queued => {}
            Offer::Replaced(old) => {
                counter!("queue_superseded_total", 1u64);
                debug!(project = %old.event.project_id, kind = %old.event.kind, id = %old.ack.id(), "queued entry superseded");
            }
            Offer::Dropped(new) => {
                counter!("queue_dropped_total", 1u64);
                debug!(project = %new.event.project_id, kind = %new.event.kind, id = %new.ack.id(), "incoming entry dropped; another kind is already queued");
            }
        }
        if let Some(e) = offer.into_ackable() {
            ack_quietly(&e).await;
        }
    }

    pub fn pop(&self) -> Option<QueueEntry> {
        let (e, depth) = {
            let mut q = self.lock();
            let e = q.pop_front();
            (e, q.len())
        };
        gauge!("queue_depth", depth as f64);
        e
    }

    /// Drop and ack every pending entry for `project_id`. Returns how many were purged.
    pub async fn purge_project(&self, project_id: &str) -> usize {
        let purged = self.lock().remove_project_entries(project_id);
        for e in &purged {
            ack_quietly(e).await;
        }
        purged.len()
    }
}

async fn ack_quietly(e: &QueueEntry) {
    // A failed ack only means the entry comes back on the next backlog pass.
    if let Err(err) = e.ack.ack().await {
        warn!(project = %e.event.project_id, id = %e.ack.id(), error = %err, "ack of superseded entry failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ProjectType;
    use keel_stream::MemoryBroker;

    fn entry(kind: EventKind, project: &str, id: &str) -> QueueEntry {
        let broker: Arc<MemoryBroker> = Arc::new(MemoryBroker::new());
        let event = StreamEvent {
            kind,
            project_id: project.into(),
            deployment_id: format!("dep-{}", id),
            commit_hash: String::new(),
            project_type: Some(ProjectType::Dynamic),
            request_id: String::new(),
        };
        QueueEntry::new(event, AckHandle::new(broker, "t", "g", id))
    }

    fn acked_id(o: Offer) -> Option<String> { o.into_ackable().map(|e| e.ack.id().to_string()) }

    #[test]
    fn same_kind_replaces_and_returns_old() {
        let mut q = CollapsingQueue::default();
        assert!(matches!(q.push(entry(EventKind::Created, "p", "1-0")), Offer::Queued));
        assert_eq!(acked_id(q.push(entry(EventKind::Created, "p", "2-0"))), Some("1-0".into()));
        assert_eq!(acked_id(q.push(entry(EventKind::Created, "p", "3-0"))), Some("2-0".into()));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_front().unwrap().ack.id(), "3-0");
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn queued_created_beats_later_deleted_and_requested() {
        let mut q = CollapsingQueue::default();
        q.push(entry(EventKind::Created, "p", "1-0"));
        assert!(matches!(q.push(entry(EventKind::Deleted, "p", "2-0")), Offer::Dropped(_)));
        assert!(matches!(q.push(entry(EventKind::Requested, "p", "3-0")), Offer::Dropped(_)));
        let e = q.pop_front().unwrap();
        assert_eq!(e.event.kind, EventKind::Created);
        assert_eq!(e.ack.id(), "1-0");
    }

    #[test]
    fn incoming_created_beats_queued_deleted() {
        let mut q = CollapsingQueue::default();
        q.push(entry(EventKind::Deleted, "p", "1-0"));
        assert_eq!(acked_id(q.push(entry(EventKind::Created, "p", "2-0"))), Some("1-0".into()));
        assert_eq!(q.queued_kind("p"), Some(&EventKind::Created));
    }

    #[test]
    fn deleted_is_dropped_while_requested_is_queued() {
        let mut q = CollapsingQueue::default();
        q.push(entry(EventKind::Requested, "p", "1-0"));
        assert!(matches!(q.push(entry(EventKind::Deleted, "p", "2-0")), Offer::Dropped(_)));
        assert_eq!(q.queued_kind("p"), Some(&EventKind::Requested));
    }

    #[test]
    fn latest_wins_policy_keeps_deleted() {
        let mut q = CollapsingQueue::with_policy(CollapsePolicy::LatestWins);
        q.push(entry(EventKind::Created, "p", "1-0"));
        assert_eq!(acked_id(q.push(entry(EventKind::Deleted, "p", "2-0"))), Some("1-0".into()));
        assert_eq!(q.pop_front().unwrap().event.kind, EventKind::Deleted);
    }

    #[test]
    fn replacement_keeps_queue_position() {
        let mut q = CollapsingQueue::default();
        q.push(entry(EventKind::Created, "a", "1-0"));
        q.push(entry(EventKind::Created, "b", "2-0"));
        q.push(entry(EventKind::Created, "a", "3-0"));
        assert_eq!(q.pop_front().unwrap().ack.id(), "3-0");
        assert_eq!(q.pop_front().unwrap().ack.id(), "2-0");
    }

    #[test]
    fn purge_then_requeue_does_not_resurrect_stale_slot() {
        let mut q = CollapsingQueue::default();
        q.push(entry(EventKind::Created, "a", "1-0"));
        q.push(entry(EventKind::Created, "b", "2-0"));
        assert_eq!(q.remove_project_entries("a").len(), 1);
        assert!(q.remove_project_entries("a").is_empty());
        q.push(entry(EventKind::Deleted, "a", "3-0"));
        assert_eq!(q.pop_front().unwrap().event.project_id, "b");
        assert_eq!(q.pop_front().unwrap().ack.id(), "3-0");
        assert!(q.is_empty());
        assert_eq!(q.superseded(), 1);
    }

    #[test]
    fn policy_parses() {
        assert_eq!("created-wins".parse::<CollapsePolicy>().unwrap(), CollapsePolicy::CreatedWins);
        assert_eq!("latest-wins".parse::<CollapsePolicy>().unwrap(), CollapsePolicy::LatestWins);
        assert!("first-wins".parse::<CollapsePolicy>().is_err());
    }
}
