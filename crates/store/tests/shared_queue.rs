#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::{EventKind, ProjectType, StreamEvent};
use keel_store::{CollapsePolicy, QueueEntry, SharedQueue};
use keel_stream::{publish, AckHandle, Delivery, MemoryBroker, StreamConsumer, StreamHandler};

const TOPIC: &str = "deployments";
const GROUP: &str = "orchestrator";

struct Enqueue(SharedQueue);

#[async_trait::async_trait]
impl StreamHandler for Enqueue {
    async fn handle(&self, delivery: Delivery, ack: AckHandle) {
        let ev: StreamEvent = delivery.decode().unwrap();
        self.0.offer(QueueEntry::new(ev, ack)).await;
    }
}

fn ev(kind: EventKind, project: &str, deployment: &str) -> StreamEvent {
    StreamEvent {
        kind,
        project_id: project.into(),
        deployment_id: deployment.into(),
        commit_hash: String::new(),
        project_type: Some(ProjectType::Static),
        request_id: String::new(),
    }
}

async fn setup(events: &[StreamEvent], policy: CollapsePolicy) -> (Arc<MemoryBroker>, SharedQueue, Vec<String>) {
    let broker = Arc::new(MemoryBroker::new());
    let consumer = StreamConsumer::new(broker.clone(), TOPIC, GROUP, "c").with_block(Duration::ZERO);
    consumer.initialize_group().await.unwrap();
    let mut ids = Vec::new();
    for e in events {
        ids.push(publish(broker.as_ref(), TOPIC, e).await.unwrap());
    }
    let queue = SharedQueue::new(policy);
    consumer.poll_live(&Enqueue(queue.clone())).await.unwrap();
    (broker, queue, ids)
}

#[tokio::test]
async fn duplicate_created_acks_first_at_collapse_time() {
    let events = [ev(EventKind::Created, "p", "d1"), ev(EventKind::Created, "p", "d1")];
    let (broker, queue, ids) = setup(&events, CollapsePolicy::CreatedWins).await;

    assert_eq!(queue.len(), 1);
    // The first message is already acked; the second waits for processing.
    assert_eq!(broker.pending_ids(TOPIC, GROUP), vec![ids[1].clone()]);

    let entry = queue.pop().unwrap();
    assert_eq!(entry.ack.id(), ids[1]);
    entry.ack.ack().await.unwrap();
    assert!(broker.pending_ids(TOPIC, GROUP).is_empty());
}

#[tokio::test]
async fn deleted_after_created_is_acked_and_dropped() {
    let events = [ev(EventKind::Created, "p", "d1"), ev(EventKind::Deleted, "p", "d1")];
    let (broker, queue, ids) = setup(&events, CollapsePolicy::CreatedWins).await;

    assert_eq!(broker.pending_ids(TOPIC, GROUP), vec![ids[0].clone()]);
    let entry = queue.pop().unwrap();
    assert_eq!(entry.event.kind, EventKind::Created);
    assert!(queue.pop().is_none());
}

#[tokio::test]
async fn latest_wins_keeps_the_delete() {
    let events = [ev(EventKind::Created, "p", "d1"), ev(EventKind::Deleted, "p", "d1")];
    let (broker, queue, ids) = setup(&events, CollapsePolicy::LatestWins).await;

    assert_eq!(broker.pending_ids(TOPIC, GROUP), vec![ids[1].clone()]);
    assert_eq!(queue.pop().unwrap().event.kind, EventKind::Deleted);
}

#[tokio::test]
async fn purge_acks_pending_entries_of_one_project() {
    let events = [ev(EventKind::Created, "a", "d1"), ev(EventKind::Created, "b", "d2")];
    let (broker, queue, ids) = setup(&events, CollapsePolicy::CreatedWins).await;

    assert_eq!(queue.purge_project("a").await, 1);
    assert_eq!(queue.purge_project("a").await, 0);
    assert_eq!(broker.pending_ids(TOPIC, GROUP), vec![ids[1].clone()]);
    assert_eq!(queue.pop().unwrap().event.project_id, "b");
}
