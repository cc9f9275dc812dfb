//! Pub/sub consumption.
//!
//! The [`PubSub`] trait is the broker contract the runtime consumes: topic and
//! subscription provisioning plus a pull-based receive with per-message
//! ack/nack. [`Subscriber`] drives one pull loop per subscribed topic and turns
//! every delivery into a run of the topic's [`Action`]s.
//!
//! Delivery is at-least-once: a message is acknowledged only when every action
//! succeeded, anything else asks the broker to redeliver it.
//!
//! # Naming
//!
//! Topics are named `{env}.{topic}` and subscriptions
//! `{env}.{consumer}.{topic}`, with the topic part lower-cased.

pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use prost::Message;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::action::{Action, Topics, run_actions};
use crate::config::SubscriberConfig;
use crate::context::Context;
use crate::error::Error;
use crate::event::Event;

/// Label carrying the deployment environment on topics and subscriptions.
pub const ENV_LABEL: &str = "env";

pub type Labels = HashMap<String, String>;

/// Errors reported by a pub/sub transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PubSubError {
    /// The broker could not be reached
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No topic with this name
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// No subscription with this name
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Pulling from a subscription failed
    #[error("Receive failed for subscription '{subscription}': {reason}")]
    ReceiveFailed {
        subscription: String,
        reason: String,
    },

}

/// Settings of a subscription at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Full name of the topic the subscription is attached to.
    pub topic: String,
    pub ack_deadline: Duration,
    pub labels: Labels,
}

/// Settles one delivery with the broker.
pub trait AckHandle: Send + Sync {
    fn ack(self: Box<Self>);
    fn nack(self: Box<Self>);
}

/// A message pulled from a subscription. Must be acked or nacked exactly once.
pub struct Delivery {
    pub id: String,
    pub data: Bytes,
    pub attributes: HashMap<String, String>,
    pub publish_time: DateTime<Utc>,
    handle: Box<dyn AckHandle>,
}

impl Delivery {
    pub fn new(
        id: impl Into<String>,
        data: Bytes,
        publish_time: DateTime<Utc>,
        handle: Box<dyn AckHandle>,
    ) -> Self {
        Self {
            id: id.into(),
            data,
            attributes: HashMap::new(),
            publish_time,
            handle,
        }
    }

    pub fn with_attributes(self, attributes: HashMap<String, String>) -> Self {
        Self { attributes, ..self }
    }

    /// Removes the message from redelivery.
    pub fn ack(self) {
        self.handle.ack();
    }

    /// Asks the broker to redeliver the message.
    pub fn nack(self) {
        self.handle.nack();
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .field("attributes", &self.attributes)
            .field("publish_time", &self.publish_time)
            .finish_non_exhaustive()
    }
}

/// Broker operations used by the subscription runner.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn topic_exists(&self, name: &str) -> Result<bool, PubSubError>;

    async fn create_topic(&self, name: &str, labels: Labels) -> Result<(), PubSubError>;

    async fn topic_labels(&self, name: &str) -> Result<Labels, PubSubError>;

    async fn update_topic_labels(&self, name: &str, labels: Labels) -> Result<(), PubSubError>;

    async fn subscription_exists(&self, name: &str) -> Result<bool, PubSubError>;

    async fn create_subscription(
        &self,
        name: &str,
        config: SubscriptionConfig,
    ) -> Result<(), PubSubError>;

    async fn delete_subscription(&self, name: &str) -> Result<(), PubSubError>;

    /// Waits for the next message of `subscription`.
    ///
    /// Dropping the returned future must not lose a message.
    async fn receive(&self, subscription: &str) -> Result<Delivery, PubSubError>;
}

pub fn topic_name(env: &str, topic: &str) -> String {
    format!("{env}.{}", topic.to_lowercase())
}

pub fn subscription_name(env: &str, consumer: &str, topic: &str) -> String {
    format!("{env}.{consumer}.{}", topic.to_lowercase())
}

/// Resolves the environment-scoped topic, creating it when missing. Returns
/// its full name.
pub async fn get_or_create_topic(
    ctx: &Context,
    pubsub: &dyn PubSub,
    env: &str,
    topic: &str,
) -> Result<String, Error> {
    let name = topic_name(env, topic);
    if !pubsub.topic_exists(&name).await? {
        pubsub.create_topic(&name, Labels::new()).await?;
        tracing::info!(parent: ctx.span(), topic = %name, "topic created");
    }
    Ok(name)
}

/// Makes sure the topic carries the `env` label. Existing labels are kept.
pub async fn update_topic(
    ctx: &Context,
    pubsub: &dyn PubSub,
    name: &str,
    env: &str,
) -> Result<Labels, Error> {
    let mut labels = pubsub.topic_labels(name).await?;
    if !labels.contains_key(ENV_LABEL) {
        labels.insert(ENV_LABEL.to_string(), env.to_string());
        pubsub.update_topic_labels(name, labels.clone()).await?;
        tracing::debug!(parent: ctx.span(), topic = name, env, "topic labelled");
    }
    Ok(labels)
}

/// Resolves the subscription, creating it on `topic` when missing.
pub async fn get_or_create_subscription(
    ctx: &Context,
    pubsub: &dyn PubSub,
    name: &str,
    topic: &str,
    config: &SubscriberConfig,
) -> Result<(), Error> {
    if pubsub.subscription_exists(name).await? {
        tracing::info!(parent: ctx.span(), subscription = name, "subscription available");
        return Ok(());
    }

    let subscription = SubscriptionConfig {
        topic: topic.to_string(),
        ack_deadline: config.ack_deadline(),
        labels: Labels::from([(ENV_LABEL.to_string(), config.environment().to_string())]),
    };
    pubsub.create_subscription(name, subscription).await?;
    tracing::info!(parent: ctx.span(), subscription = name, topic, "subscription created");
    Ok(())
}

pub async fn delete_subscription(
    ctx: &Context,
    pubsub: &dyn PubSub,
    name: &str,
) -> Result<(), Error> {
    pubsub.delete_subscription(name).await?;
    tracing::info!(parent: ctx.span(), subscription = name, "subscription deleted");
    Ok(())
}

/// Running consumer of a set of topics.
///
/// Created by [`Subscriber::subscribe`]. Pull loops run until
/// [`Subscriber::shutdown`] is called or the context it was created from is
/// cancelled.
#[derive(Debug)]
pub struct Subscriber {
    cancel: CancellationToken,
    tracker: TaskTracker,
    subscriptions: Vec<String>,
}

impl Subscriber {
    /// Provisions every topic of `topics` and its subscription for
    /// `consumer`, then starts one pull loop per topic.
    ///
    /// Provisioning errors are returned before any loop is started.
    pub async fn subscribe(
        ctx: &Context,
        pubsub: Arc<dyn PubSub>,
        consumer: &str,
        topics: &Topics,
        config: &SubscriberConfig,
    ) -> Result<Self, Error> {
        let env = config.environment();
        tracing::info!(parent: ctx.span(), consumer, ?topics, "subscribing to topics");

        let mut pullers = Vec::new();
        for topic in topics.topics() {
            let topic_name = get_or_create_topic(ctx, pubsub.as_ref(), env, topic).await?;
            update_topic(ctx, pubsub.as_ref(), &topic_name, env).await?;

            let name = subscription_name(env, consumer, topic);
            get_or_create_subscription(ctx, pubsub.as_ref(), &name, &topic_name, config).await?;
            pullers.push((name, Arc::<[Action]>::from(topics.actions(topic))));
        }

        let base = ctx.child();
        let tracker = TaskTracker::new();
        let mut subscriptions = Vec::with_capacity(pullers.len());
        for (subscription, actions) in pullers {
            let puller = Puller {
                ctx: base.clone(),
                pubsub: pubsub.clone(),
                subscription: subscription.clone(),
                actions,
                config: config.clone(),
                tracker: tracker.clone(),
            };
            tracker.spawn(puller.run());
            subscriptions.push(subscription);
        }

        Ok(Self {
            cancel: base.cancellation().clone(),
            tracker,
            subscriptions,
        })
    }

    /// Full names of the subscriptions being pulled.
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Stops pulling and waits for in-flight messages to be settled.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

struct Puller {
    ctx: Context,
    pubsub: Arc<dyn PubSub>,
    subscription: String,
    actions: Arc<[Action]>,
    config: SubscriberConfig,
    tracker: TaskTracker,
}

impl Puller {
    async fn run(self) {
        let subscription = self.subscription.as_str();
        let cancel = self.ctx.cancellation().clone();
        if !self.subscription_ready(&cancel).await {
            tracing::info!(parent: self.ctx.span(), subscription, "pull loop stopped");
            return;
        }

        let permits = Arc::new(Semaphore::new(self.config.max_outstanding_messages()));
        tracing::info!(parent: self.ctx.span(), subscription, "pulling messages");

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.pubsub.receive(subscription) => received,
            };

            match received {
                Ok(delivery) => {
                    let ctx = self.ctx.clone();
                    let actions = self.actions.clone();
                    let subscription = self.subscription.clone();
                    self.tracker.spawn(async move {
                        handle_delivery(&ctx, &subscription, &actions, delivery).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    tracing::error!(
                        parent: self.ctx.span(),
                        subscription,
                        error = %e,
                        retry_in = ?self.config.receive_retry_interval(),
                        "receive failed"
                    );
                    if !self.pause(&cancel).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(parent: self.ctx.span(), subscription, "pull loop stopped");
    }

    /// Waits until the broker confirms the subscription exists. Broker errors
    /// are retried; returns false when the subscription is missing or the loop
    /// was cancelled.
    async fn subscription_ready(&self, cancel: &CancellationToken) -> bool {
        let subscription = self.subscription.as_str();
        loop {
            let exists = tokio::select! {
                _ = cancel.cancelled() => return false,
                exists = self.pubsub.subscription_exists(subscription) => exists,
            };
            match exists {
                Ok(true) => return true,
                Ok(false) => {
                    tracing::error!(
                        parent: self.ctx.span(),
                        subscription,
                        "subscription does not exist"
                    );
                    return false;
                }
                Err(e) => {
                    tracing::error!(
                        parent: self.ctx.span(),
                        subscription,
                        error = %e,
                        retry_in = ?self.config.receive_retry_interval(),
                        "subscription check failed"
                    );
                    if !self.pause(cancel).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Sleeps for the retry interval. Returns false if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.receive_retry_interval()) => true,
        }
    }
}

/// Decodes one delivery, runs `actions` against it, and settles it.
async fn handle_delivery(
    ctx: &Context,
    subscription: &str,
    actions: &[Action],
    delivery: Delivery,
) {
    let event = match Event::decode(delivery.data.clone()) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(
                parent: ctx.span(),
                subscription,
                message_id = %delivery.id,
                error = %e,
                "malformed message"
            );
            delivery.nack();
            return;
        }
    };

    let ctx = match event.eid() {
        Some(eid) => ctx.with_eid(eid),
        None => ctx.clone(),
    };
    let span = ctx.span().clone();

    async move {
        tracing::info!(
            subscription,
            message_id = %delivery.id,
            topic = %event.topic,
            aggregate_id = event.aggregate_id(),
            version = event.version(),
            "message received"
        );
        match run_actions(&ctx, actions, Arc::new(event)).await {
            Ok(()) => delivery.ack(),
            Err(e) => {
                tracing::error!(
                    subscription,
                    message_id = %delivery.id,
                    error = %e,
                    "action failed"
                );
                delivery.nack();
            }
        }
    }
    .instrument(span)
    .await
}
