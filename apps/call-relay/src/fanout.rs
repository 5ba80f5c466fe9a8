use std::collections::HashMap;

use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::types::CallEvent;

struct Subscriber {
    filter: Option<String>,
    sender: mpsc::Sender<CallEvent>,
}

impl Subscriber {
    fn wants(&self, call_id: &str) -> bool {
        self.filter
            .as_deref()
            .is_none_or(|filter| filter == call_id)
    }
}

/// Receiving half handed to a connection when it subscribes.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<CallEvent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Live subscriber set with per-connection call filters.
///
/// Delivery never waits on a subscriber: each one owns a bounded queue and a
/// full or closed queue removes that subscriber on the spot.
pub struct SubscriberHub {
    queue_capacity: usize,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
}

impl SubscriberHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let id = Uuid::now_v7();
        self.subscribers.lock().await.insert(
            id,
            Subscriber {
                filter: None,
                sender,
            },
        );
        tracing::debug!(subscriber_id = %id, "subscriber connected");
        Subscription { id, receiver }
    }

    /// Narrows a subscriber to one call, or widens it back to all calls.
    /// Returns false when the subscriber is already gone.
    pub async fn set_filter(&self, id: Uuid, call_id: Option<String>) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        match subscribers.get_mut(&id) {
            Some(subscriber) => {
                tracing::debug!(subscriber_id = %id, call_id = ?call_id, "subscriber filter set");
                subscriber.filter = call_id;
                true
            }
            None => false,
        }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        if self.subscribers.lock().await.remove(&id).is_some() {
            tracing::debug!(subscriber_id = %id, "subscriber removed");
        }
    }

    pub async fn broadcast(&self, event: &CallEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|id, subscriber| {
            if !subscriber.wants(&event.call_id) {
                return true;
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(error) => {
                    tracing::warn!(
                        subscriber_id = %id,
                        call_id = %event.call_id,
                        reason = %error,
                        "dropping subscriber after failed delivery"
                    );
                    report.evicted += 1;
                    false
                }
            }
        });
        report
    }

    pub async fn len(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}
