//! Explicit registration of message handlers
//!
//! Handlers are registered once at startup through a [`HandlerRegistryBuilder`]. The resulting
//! [`HandlerRegistry`] is immutable and groups all descriptors by consumer group, which is the
//! unit both the dispatcher and the pending-retry processor operate on.

use crate::library::communication::{Codec, CodecError, TransportMessage};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Ordered pair identifying one logical partition of work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicGroup {
    /// Name of the topic
    pub topic: String,
    /// Name of the consumer group
    pub group: String,
}

impl TopicGroup {
    /// Creates a new key
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for TopicGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.group)
    }
}

/// Errors detected while building a [`HandlerRegistry`]
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Subscription without a topic
    #[error("subscription in group '{0}' has an empty topic")]
    EmptyTopic(String),
    /// Subscription without a group
    #[error("subscription to topic '{0}' has an empty group")]
    EmptyGroup(String),
    /// Subscription that would never run its handler
    #[error("subscription {0} has a concurrency limit of zero")]
    ZeroConcurrency(TopicGroup),
    /// Two handlers compete for the same messages
    #[error("subscription {key} for message name {name:?} is registered more than once")]
    Duplicate {
        /// Key of both subscriptions
        key: TopicGroup,
        /// Message name filter shared by both subscriptions
        name: Option<String>,
    },
}

/// Reasons for an invocation to not complete successfully
#[derive(Debug, Error)]
pub enum InvocationError {
    /// Body could not be decoded into the payload type of the handler
    #[error("unable to decode payload")]
    Decode(#[from] CodecError),
    /// Handler returned an error
    #[error("handler failed")]
    Handler(#[source] BoxedError),
}

/// Typed consumer of messages
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Type the message body is decoded into
    type Payload: DeserializeOwned + Send + 'static;

    /// Processes a message, returning an error leaves it unacknowledged
    async fn handle(&self, payload: Self::Payload, message: &TransportMessage) -> EmptyResult;
}

/// [`Handler`] wrapping a closure, created by [`handler_fn`]
pub struct FnHandler<P, F> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

/// Creates a [`Handler`] from a closure receiving the decoded payload and the message
pub fn handler_fn<P, F, Fut>(f: F) -> FnHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, TransportMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EmptyResult> + Send + 'static,
{
    FnHandler {
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<P, F, Fut> Handler for FnHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, TransportMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EmptyResult> + Send + 'static,
{
    type Payload = P;

    async fn handle(&self, payload: P, message: &TransportMessage) -> EmptyResult {
        (self.f)(payload, message.clone()).await
    }
}

#[async_trait]
trait Invoker: Send + Sync {
    async fn invoke(&self, codec: Codec, message: &TransportMessage)
        -> Result<(), InvocationError>;
}

struct TypedInvoker<H>(H);

#[async_trait]
impl<H: Handler> Invoker for TypedInvoker<H> {
    async fn invoke(
        &self,
        codec: Codec,
        message: &TransportMessage,
    ) -> Result<(), InvocationError> {
        let payload: H::Payload = codec.for_message(message)?.deserialize(message.body())?;

        self.0
            .handle(payload, message)
            .await
            .map_err(InvocationError::Handler)
    }
}

/// Options of a single subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Maximum number of messages handled in parallel
    pub concurrency: usize,
    /// Acknowledge messages before handing them to the handler (at-most-once delivery)
    pub auto_ack: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            auto_ack: false,
        }
    }
}

/// Declares which messages a handler receives
#[derive(Debug, Clone)]
pub struct Subscription {
    key: TopicGroup,
    name: Option<String>,
    options: SubscriptionOptions,
}

impl Subscription {
    /// Subscribes to all messages of `topic` on behalf of `group`
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            key: TopicGroup::new(topic, group),
            name: None,
            options: SubscriptionOptions::default(),
        }
    }

    /// Restricts the subscription to messages with the given name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the maximum number of messages handled in parallel
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.options.concurrency = concurrency;
        self
    }

    /// Enables or disables acknowledging before invocation
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.options.auto_ack = auto_ack;
        self
    }
}

/// Immutable description of a registered handler
pub struct HandlerDescriptor {
    key: TopicGroup,
    name: Option<String>,
    payload_type: &'static str,
    options: SubscriptionOptions,
    invoker: Box<dyn Invoker>,
}

impl HandlerDescriptor {
    /// Topic and group this handler consumes
    pub fn key(&self) -> &TopicGroup {
        &self.key
    }

    /// Message name filter, `None` for catch-all handlers
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name of the payload type the handler expects
    pub fn payload_type(&self) -> &'static str {
        self.payload_type
    }

    /// Subscription options
    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    /// Decodes the message body and runs the handler
    pub async fn invoke(
        &self,
        codec: Codec,
        message: &TransportMessage,
    ) -> Result<(), InvocationError> {
        self.invoker.invoke(codec, message).await
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("payload_type", &self.payload_type)
            .field("options", &self.options)
            .finish()
    }
}

/// Collects subscriptions before they are validated into a [`HandlerRegistry`]
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    descriptors: Vec<HandlerDescriptor>,
}

impl HandlerRegistryBuilder {
    /// Registers a handler for a subscription
    pub fn subscribe<H: Handler>(mut self, subscription: Subscription, handler: H) -> Self {
        self.descriptors.push(HandlerDescriptor {
            key: subscription.key,
            name: subscription.name,
            payload_type: std::any::type_name::<H::Payload>(),
            options: subscription.options,
            invoker: Box::new(TypedInvoker(handler)),
        });

        self
    }

    /// Validates all subscriptions and freezes them
    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        let mut groups: BTreeMap<String, Vec<Arc<HandlerDescriptor>>> = BTreeMap::new();

        for descriptor in self.descriptors {
            let key = &descriptor.key;

            if key.topic.is_empty() {
                return Err(RegistryError::EmptyTopic(key.group.clone()));
            }

            if key.group.is_empty() {
                return Err(RegistryError::EmptyGroup(key.topic.clone()));
            }

            if descriptor.options.concurrency == 0 {
                return Err(RegistryError::ZeroConcurrency(key.clone()));
            }

            let siblings = groups.entry(key.group.clone()).or_default();

            if siblings
                .iter()
                .any(|other| other.key == *key && other.name == descriptor.name)
            {
                return Err(RegistryError::Duplicate {
                    key: key.clone(),
                    name: descriptor.name.clone(),
                });
            }

            siblings.push(Arc::new(descriptor));
        }

        Ok(HandlerRegistry { groups })
    }
}

/// Read-only mapping from consumer group to its handler descriptors in registration order
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    groups: BTreeMap<String, Vec<Arc<HandlerDescriptor>>>,
}

impl HandlerRegistry {
    /// Starts collecting subscriptions
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Whether no handler has been registered
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Names of all groups with at least one handler
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Descriptors of a group in registration order
    pub fn group(&self, group: &str) -> &[Arc<HandlerDescriptor>] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct topics the handlers of a group subscribe to, in registration order
    pub fn candidate_topics(&self, group: &str) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();

        for descriptor in self.group(group) {
            if !topics.contains(&descriptor.key.topic) {
                topics.push(descriptor.key.topic.clone());
            }
        }

        topics
    }

    /// All distinct keys, sorted
    pub fn keys(&self) -> Vec<TopicGroup> {
        let mut keys: Vec<TopicGroup> = self
            .groups
            .values()
            .flatten()
            .map(|descriptor| descriptor.key.clone())
            .collect();

        keys.sort();
        keys.dedup();
        keys
    }

    /// Descriptors registered for a key
    pub fn descriptors<'a>(
        &'a self,
        key: &'a TopicGroup,
    ) -> impl Iterator<Item = &'a Arc<HandlerDescriptor>> + 'a {
        self.group(&key.group)
            .iter()
            .filter(move |descriptor| descriptor.key == *key)
    }

    /// Largest concurrency limit among the descriptors of a key
    pub fn concurrency(&self, key: &TopicGroup) -> usize {
        self.descriptors(key)
            .map(|descriptor| descriptor.options.concurrency)
            .max()
            .unwrap_or(1)
    }

    /// Picks the handler for a message, preferring an exact name match over a catch-all
    pub fn select(
        &self,
        key: &TopicGroup,
        message: &TransportMessage,
    ) -> Option<Arc<HandlerDescriptor>> {
        let name = message.name();

        self.descriptors(key)
            .find(|descriptor| descriptor.name() == Some(name))
            .or_else(|| self.descriptors(key).find(|descriptor| descriptor.name.is_none()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::communication::{headers, Headers};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Order {
        amount: u32,
    }

    fn accept() -> FnHandler<Order, impl Fn(Order, TransportMessage) -> futures::future::Ready<EmptyResult>>
    {
        handler_fn(|_order: Order, _message| futures::future::ready(Ok(())))
    }

    fn message(name: Option<&str>) -> TransportMessage {
        let mut message = TransportMessage::new("orders", Headers::new(), b"{\"amount\":3}".to_vec());
        if let Some(name) = name {
            message.set_header(headers::MESSAGE_NAME, name);
        }
        message
    }

    #[test]
    fn groups_descriptors_by_consumer_group() {
        let registry = HandlerRegistry::builder()
            .subscribe(Subscription::new("orders", "billing"), accept())
            .subscribe(Subscription::new("refunds", "billing"), accept())
            .subscribe(Subscription::new("orders", "shipping"), accept())
            .subscribe(Subscription::new("orders", "billing").named("urgent"), accept())
            .build()
            .unwrap();

        assert_eq!(registry.groups().collect::<Vec<_>>(), vec!["billing", "shipping"]);
        assert_eq!(registry.group("billing").len(), 3);
        assert_eq!(
            registry.candidate_topics("billing"),
            vec!["orders".to_owned(), "refunds".to_owned()]
        );
        assert_eq!(
            registry.keys(),
            vec![
                TopicGroup::new("orders", "billing"),
                TopicGroup::new("orders", "shipping"),
                TopicGroup::new("refunds", "billing"),
            ]
        );
        assert!(registry.candidate_topics("unknown").is_empty());
    }

    #[test]
    fn rejects_invalid_subscriptions() {
        let empty_topic = HandlerRegistry::builder()
            .subscribe(Subscription::new("", "billing"), accept())
            .build();
        assert!(matches!(empty_topic, Err(RegistryError::EmptyTopic(_))));

        let empty_group = HandlerRegistry::builder()
            .subscribe(Subscription::new("orders", ""), accept())
            .build();
        assert!(matches!(empty_group, Err(RegistryError::EmptyGroup(_))));

        let zero = HandlerRegistry::builder()
            .subscribe(Subscription::new("orders", "billing").concurrency(0), accept())
            .build();
        assert!(matches!(zero, Err(RegistryError::ZeroConcurrency(_))));

        let duplicate = HandlerRegistry::builder()
            .subscribe(Subscription::new("orders", "billing"), accept())
            .subscribe(Subscription::new("orders", "billing"), accept())
            .build();
        assert!(matches!(duplicate, Err(RegistryError::Duplicate { .. })));
    }

    #[test]
    fn selects_exact_name_before_catch_all() {
        let registry = HandlerRegistry::builder()
            .subscribe(Subscription::new("orders", "billing"), accept())
            .subscribe(
                Subscription::new("orders", "billing").named("urgent").concurrency(20),
                accept(),
            )
            .build()
            .unwrap();
        let key = TopicGroup::new("orders", "billing");

        let urgent = registry.select(&key, &message(Some("urgent"))).unwrap();
        assert_eq!(urgent.name(), Some("urgent"));

        let other = registry.select(&key, &message(None)).unwrap();
        assert_eq!(other.name(), None);

        assert_eq!(registry.concurrency(&key), 20);
    }

    #[test]
    fn unmatched_messages_have_no_handler() {
        let registry = HandlerRegistry::builder()
            .subscribe(Subscription::new("orders", "billing").named("urgent"), accept())
            .build()
            .unwrap();

        let key = TopicGroup::new("orders", "billing");
        assert!(registry.select(&key, &message(Some("routine"))).is_none());
    }

    #[tokio::test]
    async fn invocation_decodes_payload() {
        let registry = HandlerRegistry::builder()
            .subscribe(
                Subscription::new("orders", "billing"),
                handler_fn(|order: Order, _message| async move {
                    let result: EmptyResult = if order.amount == 3 {
                        Ok(())
                    } else {
                        Err("unexpected amount".into())
                    };
                    result
                }),
            )
            .build()
            .unwrap();

        let key = TopicGroup::new("orders", "billing");
        let descriptor = registry.select(&key, &message(None)).unwrap();
        assert!(descriptor.payload_type().ends_with("Order"));
        assert!(descriptor.invoke(Codec::Json, &message(None)).await.is_ok());

        let garbage = TransportMessage::new("orders", Headers::new(), b"nope".to_vec());
        assert!(matches!(
            descriptor.invoke(Codec::Json, &garbage).await,
            Err(InvocationError::Decode(_))
        ));
    }
}
