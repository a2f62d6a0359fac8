use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::domain::PublishedEvent;

/// In-process pub/sub fan-out with backpressure. Durability and replay
/// come from the persisted event log (see [`crate::store`]); this bus only
/// has to get already-committed events to whatever subscribers are
/// currently attached, and to shed slow ones rather than block publishers.
///
/// A single-node deployment never needs more than this; if the API and
/// engine ever run as separate processes, this is the seam where a real
/// message bus would be swapped in without touching callers.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<Uuid, HashMap<Uuid, mpsc::Sender<PublishedEvent>>>>>,
    queue_len: usize,
}

pub struct Subscription {
    pub id: Uuid,
    pub client_id: Uuid,
    pub receiver: mpsc::Receiver<PublishedEvent>,
    bus: EventBus,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let bus = self.bus.clone();
        let client_id = self.client_id;
        let id = self.id;
        tokio::spawn(async move {
            bus.unsubscribe(client_id, id).await;
        });
    }
}

impl EventBus {
    pub fn new(queue_len: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            queue_len,
        }
    }

    pub async fn subscribe(&self, client_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_len);
        let id = Uuid::new_v4();
        let mut subs = self.subscribers.write().await;
        subs.entry(client_id).or_default().insert(id, tx);
        Subscription {
            id,
            client_id,
            receiver: rx,
            bus: self.clone(),
        }
    }

    async fn unsubscribe(&self, client_id: Uuid, id: Uuid) {
        let mut subs = self.subscribers.write().await;
        if let Some(per_client) = subs.get_mut(&client_id) {
            per_client.remove(&id);
            if per_client.is_empty() {
                subs.remove(&client_id);
            }
        }
    }

    /// Publishes to every live subscriber for the event's client. A
    /// subscriber whose queue is full is disconnected rather than allowed
    /// to stall the publisher — the slow-consumer policy from the
    /// concurrency model.
    pub async fn publish(&self, event: PublishedEvent) {
        let mut to_drop = Vec::new();
        {
            let subs = self.subscribers.read().await;
            if let Some(per_client) = subs.get(&event.client_id) {
                for (id, tx) in per_client {
                    if tx.try_send(event.clone()).is_err() {
                        to_drop.push(*id);
                    }
                }
            }
        }
        if !to_drop.is_empty() {
            let mut subs = self.subscribers.write().await;
            if let Some(per_client) = subs.get_mut(&event.client_id) {
                for id in to_drop {
                    per_client.remove(&id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(client_id: Uuid, seq: i64) -> PublishedEvent {
        PublishedEvent {
            client_id,
            seq: Some(seq),
            event_type: crate::domain::EventType::PaymentStatusChanged,
            payload: serde_json::json!({ "seq": seq }),
        }
    }

    #[tokio::test]
    async fn a_subscriber_receives_only_events_for_its_own_client() {
        let bus = EventBus::new(8);
        let client_id = Uuid::new_v4();
        let other_client_id = Uuid::new_v4();
        let mut sub = bus.subscribe(client_id).await;

        bus.publish(event(other_client_id, 1)).await;
        bus.publish(event(client_id, 1)).await;

        let received = sub.receiver.recv().await.unwrap();
        assert_eq!(received.client_id, client_id);
        assert_eq!(received.seq, Some(1));
    }

    #[tokio::test]
    async fn a_slow_consumer_is_dropped_instead_of_blocking_the_publisher() {
        let bus = EventBus::new(1);
        let client_id = Uuid::new_v4();
        let mut sub = bus.subscribe(client_id).await;

        // Fill the bounded queue (capacity 1) without ever reading it.
        bus.publish(event(client_id, 1)).await;
        // The second publish finds the queue full and sheds the subscriber
        // rather than blocking — this call must return promptly.
        bus.publish(event(client_id, 2)).await;
        // A third publish has no subscriber left to try_send into; it is a
        // silent no-op, not a panic or a block.
        bus.publish(event(client_id, 3)).await;

        let first = sub.receiver.recv().await.unwrap();
        assert_eq!(first.seq, Some(1));
        // Channel is closed (sender side dropped) once the second publish
        // evicted the subscriber, so nothing further ever arrives.
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn publishing_with_no_subscribers_is_a_silent_no_op() {
        let bus = EventBus::new(8);
        bus.publish(event(Uuid::new_v4(), 1)).await;
    }

    #[tokio::test]
    async fn dropping_a_subscription_unregisters_it() {
        let bus = EventBus::new(8);
        let client_id = Uuid::new_v4();
        let sub = bus.subscribe(client_id).await;
        drop(sub);

        // Give the Drop-spawned unsubscribe task a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let subs = bus.subscribers.read().await;
        assert!(subs.get(&client_id).is_none());
    }
}
