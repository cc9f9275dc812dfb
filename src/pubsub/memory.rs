//! In-memory broker.
//!
//! Topics fan out to every subscription attached to them; each subscription is
//! a FIFO queue. Nacked messages go back to the end of their queue unless
//! redelivery is turned off. Messages published to a topic before a
//! subscription exists are not delivered to it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::{AckHandle, Delivery, Labels, PubSub, PubSubError, SubscriptionConfig};

#[derive(Debug, Clone)]
struct Stored {
    id: String,
    data: Bytes,
    publish_time: DateTime<Utc>,
}

#[derive(Debug)]
struct Subscription {
    config: SubscriptionConfig,
    queue: VecDeque<Stored>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Labels>,
    subscriptions: HashMap<String, Subscription>,
    acked: Vec<String>,
    nacked: Vec<String>,
    failing_receives: usize,
    receive_calls: usize,
    failing_checks: usize,
    subscription_checks: usize,
    next_id: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    redeliver: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryPubSub {
    shared: Arc<Shared>,
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                redeliver: true,
            }),
        }
    }
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nacked messages are recorded but not queued again.
    pub fn without_redelivery(self) -> Self {
        let state = std::mem::take(&mut *self.shared.lock());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                notify: Notify::new(),
                redeliver: false,
            }),
        }
    }

    /// Publishes `data` to every subscription of `topic` and returns the
    /// message id.
    pub fn publish(&self, topic: &str, data: Bytes) -> Result<String, PubSubError> {
        let mut state = self.shared.lock();
        if !state.topics.contains_key(topic) {
            return Err(PubSubError::TopicNotFound(topic.to_string()));
        }

        state.next_id += 1;
        let stored = Stored {
            id: state.next_id.to_string(),
            data,
            publish_time: Utc::now(),
        };
        for subscription in state.subscriptions.values_mut() {
            if subscription.config.topic == topic {
                subscription.queue.push_back(stored.clone());
            }
        }
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(stored.id)
    }

    /// Makes the next `count` receive calls fail as if the broker were down.
    pub fn fail_next_receives(&self, count: usize) {
        self.shared.lock().failing_receives = count;
    }

    /// Makes the next `count` subscription checks fail as if the broker were
    /// unreachable.
    pub fn fail_next_subscription_checks(&self, count: usize) {
        self.shared.lock().failing_checks = count;
    }

    pub fn subscription_checks(&self) -> usize {
        self.shared.lock().subscription_checks
    }

    pub fn acked(&self) -> Vec<String> {
        self.shared.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<String> {
        self.shared.lock().nacked.clone()
    }

    pub fn receive_calls(&self) -> usize {
        self.shared.lock().receive_calls
    }

    /// Messages waiting in `subscription`.
    pub fn pending(&self, subscription: &str) -> usize {
        self.shared
            .lock()
            .subscriptions
            .get(subscription)
            .map(|s| s.queue.len())
            .unwrap_or_default()
    }

    pub fn subscription_config(&self, subscription: &str) -> Option<SubscriptionConfig> {
        self.shared
            .lock()
            .subscriptions
            .get(subscription)
            .map(|s| s.config.clone())
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn topic_exists(&self, name: &str) -> Result<bool, PubSubError> {
        Ok(self.shared.lock().topics.contains_key(name))
    }

    async fn create_topic(&self, name: &str, labels: Labels) -> Result<(), PubSubError> {
        self.shared.lock().topics.insert(name.to_string(), labels);
        Ok(())
    }

    async fn topic_labels(&self, name: &str) -> Result<Labels, PubSubError> {
        self.shared
            .lock()
            .topics
            .get(name)
            .cloned()
            .ok_or_else(|| PubSubError::TopicNotFound(name.to_string()))
    }

    async fn update_topic_labels(&self, name: &str, labels: Labels) -> Result<(), PubSubError> {
        let mut state = self.shared.lock();
        let current = state
            .topics
            .get_mut(name)
            .ok_or_else(|| PubSubError::TopicNotFound(name.to_string()))?;
        *current = labels;
        Ok(())
    }

    async fn subscription_exists(&self, name: &str) -> Result<bool, PubSubError> {
        let mut state = self.shared.lock();
        state.subscription_checks += 1;
        if state.failing_checks > 0 {
            state.failing_checks -= 1;
            return Err(PubSubError::ConnectionFailed("broker unavailable".to_string()));
        }
        Ok(state.subscriptions.contains_key(name))
    }

    async fn create_subscription(
        &self,
        name: &str,
        config: SubscriptionConfig,
    ) -> Result<(), PubSubError> {
        let mut state = self.shared.lock();
        if !state.topics.contains_key(&config.topic) {
            return Err(PubSubError::TopicNotFound(config.topic));
        }
        state.subscriptions.insert(
            name.to_string(),
            Subscription {
                config,
                queue: VecDeque::new(),
            },
        );
        Ok(())
    }

    async fn delete_subscription(&self, name: &str) -> Result<(), PubSubError> {
        self.shared
            .lock()
            .subscriptions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| PubSubError::SubscriptionNotFound(name.to_string()))
    }

    async fn receive(&self, subscription: &str) -> Result<Delivery, PubSubError> {
        self.shared.lock().receive_calls += 1;
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.lock();
                if state.failing_receives > 0 {
                    state.failing_receives -= 1;
                    return Err(PubSubError::ReceiveFailed {
                        subscription: subscription.to_string(),
                        reason: "broker unavailable".to_string(),
                    });
                }
                let queue = &mut state
                    .subscriptions
                    .get_mut(subscription)
                    .ok_or_else(|| PubSubError::SubscriptionNotFound(subscription.to_string()))?
                    .queue;
                if let Some(stored) = queue.pop_front() {
                    let handle = MemoryAck {
                        shared: self.shared.clone(),
                        subscription: subscription.to_string(),
                        stored: stored.clone(),
                    };
                    return Ok(Delivery::new(
                        stored.id,
                        stored.data,
                        stored.publish_time,
                        Box::new(handle),
                    ));
                }
            }
            notified.await;
        }
    }
}

struct MemoryAck {
    shared: Arc<Shared>,
    subscription: String,
    stored: Stored,
}

impl AckHandle for MemoryAck {
    fn ack(self: Box<Self>) {
        let MemoryAck { shared, stored, .. } = *self;
        shared.lock().acked.push(stored.id);
    }

    fn nack(self: Box<Self>) {
        let MemoryAck {
            shared,
            subscription,
            stored,
        } = *self;

        let mut state = shared.lock();
        state.nacked.push(stored.id.clone());
        if !shared.redeliver {
            return;
        }
        if let Some(subscription) = state.subscriptions.get_mut(&subscription) {
            subscription.queue.push_back(stored);
        }
        drop(state);
        shared.notify.notify_waiters();
    }
}
