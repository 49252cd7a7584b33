use super::{EngineError, HandlerRegistry, InvocationError, TopicGroup};
use crate::harness::{ProcessingContext, Processor, ProcessorResult};
use crate::library::communication::{
    headers, Codec, EntryId, StreamEntry, StreamGateway, TransportMessage,
};
use crate::library::helpers::Backoff;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

/// Shortest blocking read, a zero block would wait forever on redis
const MIN_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Outcome of handing a single entry to its handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handler succeeded and the entry has been acknowledged
    Acknowledged,
    /// Handler failed or the acknowledgement did not go through, the entry stays pending
    Failed,
    /// No handler matches the message, the entry stays pending
    Unroutable,
    /// Entry or payload could not be decoded, the entry stays pending
    Undecodable,
}

/// Routes entries of all registered (topic, group) pairs to their handlers
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    gateway: Arc<dyn StreamGateway>,
    codec: Codec,
    consumer: String,
}

impl Dispatcher {
    /// Creates a new dispatcher consuming as `consumer`
    pub fn new(
        registry: Arc<HandlerRegistry>,
        gateway: Arc<dyn StreamGateway>,
        codec: Codec,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            gateway,
            codec,
            consumer: consumer.into(),
        }
    }

    /// Name of the consumer used for reads and claims
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Registry the dispatcher routes with
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Gateway the dispatcher acknowledges through
    pub fn gateway(&self) -> &Arc<dyn StreamGateway> {
        &self.gateway
    }

    /// Ensures every registered group exists on all of its topics
    ///
    /// Any group that can not be resolved completely is fatal, readers are only ever started for a
    /// fully validated registry.
    #[instrument(skip(self), fields(consumer = %self.consumer))]
    pub async fn prepare(&self) -> Result<Vec<TopicGroup>, EngineError> {
        for group in self.registry.groups() {
            let candidates = self.registry.candidate_topics(group);
            let resolved = self.gateway.resolve_topics(group, &candidates).await?;

            let missing: Vec<String> = candidates
                .into_iter()
                .filter(|topic| !resolved.contains(topic))
                .collect();

            if !missing.is_empty() {
                return Err(EngineError::UnresolvedTopics {
                    group: group.to_owned(),
                    topics: missing,
                });
            }
        }

        let keys = self.registry.keys();
        info!(count = keys.len(), "Prepared consumer groups");

        Ok(keys)
    }

    /// Creates one reader per (topic, group) pair
    pub fn readers(
        self: &Arc<Self>,
        keys: &[TopicGroup],
        batch_size: usize,
        poll_timeout: Duration,
    ) -> Vec<ConsumerReader> {
        keys.iter()
            .map(|key| ConsumerReader {
                dispatcher: self.clone(),
                key: key.clone(),
                concurrency: self.registry.concurrency(key),
                batch_size: batch_size.max(1),
                poll_timeout: poll_timeout.max(MIN_POLL_TIMEOUT),
            })
            .collect()
    }

    /// Hands an entry to the best matching handler and acknowledges it on success
    ///
    /// Entries are never acknowledged on failure so that the pending-retry processor remains the
    /// single recovery path.
    pub async fn deliver(&self, key: &TopicGroup, entry: StreamEntry) -> Delivery {
        let id = entry.id;

        let mut message = match TransportMessage::from_entry(entry, &key.topic) {
            Ok(message) => message,
            Err(e) => {
                warn!(%key, entry_id = %id, error = %e, "Unable to decode entry");
                return Delivery::Undecodable;
            }
        };

        if message.header(headers::GROUP).is_none() {
            message.set_header(headers::GROUP, key.group.clone());
        }

        let descriptor = match self.registry.select(key, &message) {
            Some(descriptor) => descriptor,
            None => {
                warn!(%key, entry_id = %id, name = message.name(), "No handler matches message, leaving it pending");
                return Delivery::Unroutable;
            }
        };

        let auto_ack = descriptor.options().auto_ack;
        if auto_ack && !self.acknowledge(key, &id).await {
            return Delivery::Failed;
        }

        let outcome = AssertUnwindSafe(descriptor.invoke(self.codec, &message))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                trace!(%key, entry_id = %id, "Handled message");

                if auto_ack || self.acknowledge(key, &id).await {
                    Delivery::Acknowledged
                } else {
                    Delivery::Failed
                }
            }
            Ok(Err(InvocationError::Decode(e))) => {
                warn!(%key, entry_id = %id, payload = descriptor.payload_type(), error = %e, "Unable to decode payload");
                Delivery::Undecodable
            }
            Ok(Err(InvocationError::Handler(e))) => {
                debug!(%key, entry_id = %id, error = %e, "Handler failed, leaving message pending");
                Delivery::Failed
            }
            Err(_) => {
                error!(%key, entry_id = %id, "Handler panicked, leaving message pending");
                Delivery::Failed
            }
        }
    }

    async fn acknowledge(&self, key: &TopicGroup, id: &EntryId) -> bool {
        match self.gateway.acknowledge(&key.topic, &key.group, id).await {
            Ok(acknowledged) => {
                if !acknowledged {
                    debug!(%key, entry_id = %id, "Entry was no longer pending");
                }
                true
            }
            Err(e) => {
                warn!(%key, entry_id = %id, error = %e, "Unable to acknowledge entry");
                false
            }
        }
    }
}

/// Reads entries of one (topic, group) pair and dispatches them
///
/// Entries still pending for the reader's consumer name are resumed first, afterwards only new
/// entries are read.
pub struct ConsumerReader {
    dispatcher: Arc<Dispatcher>,
    key: TopicGroup,
    concurrency: usize,
    batch_size: usize,
    poll_timeout: Duration,
}

impl ConsumerReader {
    /// Pair this reader consumes
    pub fn key(&self) -> &TopicGroup {
        &self.key
    }

    /// Maximum number of entries handled in parallel
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Time a single read blocks waiting for new entries
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    async fn dispatch(&self, entries: Vec<StreamEntry>) {
        futures::stream::iter(entries)
            .for_each_concurrent(self.concurrency, |entry| async move {
                self.dispatcher.deliver(&self.key, entry).await;
            })
            .await;
    }
}

#[async_trait]
impl Processor for ConsumerReader {
    const NAME: &'static str = "ConsumerReader";

    fn name(&self) -> String {
        format!("{}({})", Self::NAME, self.key)
    }

    async fn run(&self, ctx: ProcessingContext) -> ProcessorResult {
        let gateway = self.dispatcher.gateway();
        let mut backoff = Backoff::new(Duration::from_millis(100), u32::MAX)
            .with_ceiling(Duration::from_secs(10));

        // Position in the consumer's own pending entries, `None` once they have been worked off
        let mut resume_after = Some(EntryId::MIN);

        // Reads are not interrupted, a shutdown is observed once the current batch completed
        loop {
            ctx.throw_if_stopping()?;

            let (topic, group) = (&self.key.topic, &self.key.group);
            let consumer = self.dispatcher.consumer();

            let read = match &resume_after {
                Some(after) => {
                    gateway
                        .read_pending(topic, group, consumer, self.batch_size, after)
                        .await
                }
                None => {
                    gateway
                        .read_new(topic, group, consumer, self.batch_size, self.poll_timeout)
                        .await
                }
            };

            match read {
                Ok(entries) => {
                    backoff.reset();

                    if resume_after.is_some() {
                        resume_after = entries.last().map(|entry| entry.id);

                        if resume_after.is_none() {
                            debug!(key = %self.key, "Resumed all pending entries");
                        } else {
                            info!(key = %self.key, count = entries.len(), "Resuming pending entries");
                        }
                    }

                    if !entries.is_empty() {
                        trace!(key = %self.key, count = entries.len(), "Read entries");
                        self.dispatch(entries).await;
                    }
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(10));
                    warn!(key = %self.key, error = %e, ?delay, "Unable to read entries, backing off");
                    ctx.wait(delay).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::communication::implementation::memory::MemoryStreamGateway;
    use crate::library::communication::Headers;
    use crate::library::EmptyResult;
    use crate::module::delivery::{handler_fn, Subscription};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPIC: &str = "orders";
    const GROUP: &str = "billing";

    #[derive(Debug, Deserialize)]
    struct Order {
        amount: u32,
    }

    fn order(amount: u32) -> TransportMessage {
        let mut message = TransportMessage::new(
            TOPIC,
            Headers::new(),
            format!("{{\"amount\":{}}}", amount).into_bytes(),
        );
        message.set_header(headers::CONTENT_TYPE, Codec::Json.content_type());
        message
    }

    async fn setup(registry: HandlerRegistry) -> (Arc<MemoryStreamGateway>, Arc<Dispatcher>) {
        let gateway = Arc::new(MemoryStreamGateway::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(registry),
            gateway.clone(),
            Codec::Json,
            "c1",
        ));

        dispatcher.prepare().await.unwrap();
        (gateway, dispatcher)
    }

    async fn read_one(gateway: &MemoryStreamGateway) -> StreamEntry {
        gateway
            .read_new(TOPIC, GROUP, "c1", 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn successful_handlers_acknowledge() {
        let registry = HandlerRegistry::builder()
            .subscribe(
                Subscription::new(TOPIC, GROUP),
                handler_fn(|_order: Order, message: TransportMessage| async move {
                    let result: EmptyResult = match message.header(headers::GROUP) {
                        Some(GROUP) => Ok(()),
                        _ => Err("group header missing".into()),
                    };
                    result
                }),
            )
            .build()
            .unwrap();
        let (gateway, dispatcher) = setup(registry).await;
        let key = TopicGroup::new(TOPIC, GROUP);

        gateway.append(TOPIC, &order(1), None).await.unwrap();
        let entry = read_one(&gateway).await;

        assert_eq!(dispatcher.deliver(&key, entry).await, Delivery::Acknowledged);
        assert_eq!(gateway.pending_count(TOPIC, GROUP), 0);
    }

    #[tokio::test]
    async fn failures_leave_entries_pending() {
        let registry = HandlerRegistry::builder()
            .subscribe(
                Subscription::new(TOPIC, GROUP),
                handler_fn(|_order: Order, _message| async move {
                    let result: EmptyResult = Err("database unavailable".into());
                    result
                }),
            )
            .build()
            .unwrap();
        let (gateway, dispatcher) = setup(registry).await;
        let key = TopicGroup::new(TOPIC, GROUP);

        gateway.append(TOPIC, &order(1), None).await.unwrap();
        let entry = read_one(&gateway).await;
        assert_eq!(dispatcher.deliver(&key, entry).await, Delivery::Failed);

        let garbage = TransportMessage::new(TOPIC, Headers::new(), b"garbage".to_vec());
        gateway.append(TOPIC, &garbage, None).await.unwrap();
        let entry = read_one(&gateway).await;
        assert_eq!(dispatcher.deliver(&key, entry).await, Delivery::Undecodable);

        assert_eq!(gateway.pending_count(TOPIC, GROUP), 2);
    }

    #[tokio::test]
    async fn unmatched_names_are_unroutable() {
        let registry = HandlerRegistry::builder()
            .subscribe(
                Subscription::new(TOPIC, GROUP).named("refund"),
                handler_fn(|_order: Order, _message| async move {
                    let result: EmptyResult = Ok(());
                    result
                }),
            )
            .build()
            .unwrap();
        let (gateway, dispatcher) = setup(registry).await;

        gateway.append(TOPIC, &order(1), None).await.unwrap();
        let entry = read_one(&gateway).await;

        let key = TopicGroup::new(TOPIC, GROUP);
        assert_eq!(dispatcher.deliver(&key, entry).await, Delivery::Unroutable);
        assert_eq!(gateway.pending_count(TOPIC, GROUP), 1);
    }

    #[tokio::test]
    async fn auto_ack_acknowledges_before_invocation() {
        let registry = HandlerRegistry::builder()
            .subscribe(
                Subscription::new(TOPIC, GROUP).auto_ack(true),
                handler_fn(|_order: Order, _message| async move {
                    let result: EmptyResult = Err("lost".into());
                    result
                }),
            )
            .build()
            .unwrap();
        let (gateway, dispatcher) = setup(registry).await;

        gateway.append(TOPIC, &order(1), None).await.unwrap();
        let entry = read_one(&gateway).await;

        let key = TopicGroup::new(TOPIC, GROUP);
        assert_eq!(dispatcher.deliver(&key, entry).await, Delivery::Failed);
        assert_eq!(gateway.pending_count(TOPIC, GROUP), 0);
    }

    #[tokio::test]
    async fn reader_delivers_in_log_order_and_stops() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handled = Arc::new(AtomicUsize::new(0));

        let registry = {
            let seen = seen.clone();
            let handled = handled.clone();

            HandlerRegistry::builder()
                .subscribe(
                    Subscription::new(TOPIC, GROUP).concurrency(1),
                    handler_fn(move |order: Order, _message| {
                        let seen = seen.clone();
                        let handled = handled.clone();
                        async move {
                            seen.lock().unwrap().push(order.amount);
                            handled.fetch_add(1, Ordering::SeqCst);
                            let result: EmptyResult = Ok(());
                            result
                        }
                    }),
                )
                .build()
                .unwrap()
        };
        let (gateway, dispatcher) = setup(registry).await;

        for amount in 0..20 {
            gateway.append(TOPIC, &order(amount), None).await.unwrap();
        }

        let keys = dispatcher.prepare().await.unwrap();
        let reader = dispatcher
            .readers(&keys, 3, Duration::from_millis(10))
            .remove(0);
        assert_eq!(reader.name(), "ConsumerReader(orders/billing)");

        let (tx, ctx) = ProcessingContext::detached();
        let task = tokio::spawn(async move { reader.run(ctx).await });

        for _ in 0..100 {
            if handled.load(Ordering::SeqCst) == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        assert!(task.await.unwrap().is_err());

        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<u32>>());
        assert_eq!(gateway.pending_count(TOPIC, GROUP), 0);
    }

    #[tokio::test]
    async fn reader_resumes_entries_pending_for_its_consumer() {
        let handled = Arc::new(std::sync::Mutex::new(Vec::new()));

        let registry = {
            let handled = handled.clone();

            HandlerRegistry::builder()
                .subscribe(
                    Subscription::new(TOPIC, GROUP),
                    handler_fn(move |order: Order, _message| {
                        let handled = handled.clone();
                        async move {
                            handled.lock().unwrap().push(order.amount);
                            let result: EmptyResult = Ok(());
                            result
                        }
                    }),
                )
                .build()
                .unwrap()
        };
        let (gateway, dispatcher) = setup(registry).await;

        // Delivered to "c1" before a restart, neither handled nor acknowledged
        gateway.append(TOPIC, &order(1), None).await.unwrap();
        read_one(&gateway).await;
        gateway.append(TOPIC, &order(2), None).await.unwrap();

        let keys = dispatcher.prepare().await.unwrap();
        let reader = dispatcher
            .readers(&keys, 10, Duration::from_millis(10))
            .remove(0);

        let (tx, ctx) = ProcessingContext::detached();
        let task = tokio::spawn(async move { reader.run(ctx).await });

        for _ in 0..100 {
            if handled.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        assert!(task.await.unwrap().is_err());

        assert_eq!(*handled.lock().unwrap(), vec![1, 2]);
        assert_eq!(gateway.pending_count(TOPIC, GROUP), 0);
    }

    #[tokio::test]
    async fn readers_never_poll_without_blocking() {
        let registry = HandlerRegistry::builder()
            .subscribe(
                Subscription::new(TOPIC, GROUP),
                handler_fn(|_order: Order, _message| async move {
                    let result: EmptyResult = Ok(());
                    result
                }),
            )
            .build()
            .unwrap();
        let (_gateway, dispatcher) = setup(registry).await;
        let keys = dispatcher.prepare().await.unwrap();

        let reader = dispatcher.readers(&keys, 0, Duration::ZERO).remove(0);
        assert_eq!(reader.poll_timeout(), Duration::from_millis(1));

        let reader = dispatcher
            .readers(&keys, 10, Duration::from_secs(2))
            .remove(0);
        assert_eq!(reader.poll_timeout(), Duration::from_secs(2));
    }
}
