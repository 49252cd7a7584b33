use super::{Delivery, DeliveryOptions, Dispatcher, StreamInfoRegistry, TopicGroup};
use crate::harness::{ProcessingContext, Processor, ProcessorResult};
use crate::library::communication::{
    headers, GatewayError, Headers, PendingEntry, TransportMessage, FIELD_BODY,
};
use crate::library::EmptyResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::lock::Mutex;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Callback invoked once for every message moved to a dead-letter stream
pub type FailureCallback = Arc<dyn Fn(TransportMessage) -> BoxFuture<'static, EmptyResult> + Send + Sync>;

/// Wraps an async closure into a [`FailureCallback`]
pub fn failure_callback<F, Fut>(f: F) -> FailureCallback
where
    F: Fn(TransportMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EmptyResult> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Thresholds steering the pending-retry processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Time an entry has to be pending before it is considered stalled
    pub idle_threshold: Duration,
    /// Number of deliveries after which an entry is dead-lettered
    pub ceiling: u64,
    /// Pause between two scans
    pub interval: Duration,
    /// Maximum number of failure callbacks running in parallel
    pub callback_concurrency: usize,
}

impl From<&DeliveryOptions> for RetryPolicy {
    fn from(options: &DeliveryOptions) -> Self {
        Self {
            idle_threshold: options.retry_idle_threshold,
            ceiling: options.retry_ceiling,
            interval: options.retry_interval,
            callback_concurrency: options.callback_concurrency,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DeliveryOptions::default())
    }
}

/// Summary of a single scan over all (topic, group) pairs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Pairs whose pending entries have been processed
    pub pairs_scanned: usize,
    /// Pairs that could not be processed due to gateway errors
    pub pairs_failed: usize,
    /// Stalled entries that have been claimed and handled successfully
    pub redelivered: usize,
    /// Entries moved to a dead-letter stream
    pub dead_lettered: usize,
}

/// Reconciles stalled deliveries
///
/// Every cycle looks at the pending entries of all known (topic, group) pairs that have been idle
/// for at least the configured threshold. Entries that exhausted their delivery budget are moved to
/// the dead-letter stream of their topic and reported through the failure callback. All others are
/// claimed by this consumer and handed to the dispatcher again.
pub struct PendingRetryProcessor {
    dispatcher: Arc<Dispatcher>,
    stream_info: Mutex<StreamInfoRegistry>,
    policy: RetryPolicy,
    on_failure: Option<FailureCallback>,
}

impl PendingRetryProcessor {
    /// Creates a new processor for the pairs contained in `stream_info`
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        stream_info: StreamInfoRegistry,
        policy: RetryPolicy,
        on_failure: Option<FailureCallback>,
    ) -> Self {
        Self {
            dispatcher,
            stream_info: Mutex::new(stream_info),
            policy,
            on_failure,
        }
    }

    /// Runs a single reconciliation cycle
    ///
    /// Errors are isolated per pair, a failing pair is reported and the remaining ones are still
    /// scanned. All failure callbacks of the cycle have completed once this returns.
    #[instrument(skip(self))]
    pub async fn scan(&self) -> ScanReport {
        let keys = {
            let mut stream_info = self.stream_info.lock().await;

            if !stream_info.is_complete() {
                stream_info
                    .resolve_pending(self.dispatcher.gateway().as_ref())
                    .await;
            }

            stream_info.keys().to_vec()
        };

        let mut report = ScanReport::default();
        let mut letters = Vec::new();

        for key in keys.iter() {
            match self.scan_pair(key, &mut letters).await {
                Ok(redelivered) => {
                    report.pairs_scanned += 1;
                    report.redelivered += redelivered;
                }
                Err(e) => {
                    warn!(%key, error = %e, "Unable to scan pending entries");
                    report.pairs_failed += 1;
                }
            }
        }

        report.dead_lettered = letters.len();
        self.notify(letters).await;

        report
    }

    async fn scan_pair(
        &self,
        key: &TopicGroup,
        letters: &mut Vec<TransportMessage>,
    ) -> Result<usize, GatewayError> {
        let gateway = self.dispatcher.gateway();
        let pending = gateway
            .list_pending(&key.topic, &key.group, self.policy.idle_threshold)
            .await?;

        if pending.is_empty() {
            return Ok(0);
        }

        let (exhausted, stalled): (Vec<PendingEntry>, Vec<PendingEntry>) = pending
            .into_iter()
            .partition(|entry| entry.deliveries > self.policy.ceiling);

        for entry in exhausted.iter() {
            if let Some(message) = self.dead_letter(key, entry).await? {
                letters.push(message);
            }
        }

        if stalled.is_empty() {
            return Ok(0);
        }

        let ids: Vec<_> = stalled.iter().map(|entry| entry.id).collect();
        let claimed = gateway
            .claim(
                &key.topic,
                &key.group,
                self.dispatcher.consumer(),
                self.policy.idle_threshold,
                &ids,
            )
            .await?;

        debug!(%key, stalled = ids.len(), claimed = claimed.len(), "Claimed stalled entries");

        let deliveries: Vec<Delivery> = futures::stream::iter(claimed)
            .map(|entry| self.dispatcher.deliver(key, entry))
            .buffer_unordered(self.dispatcher.registry().concurrency(key))
            .collect()
            .await;

        Ok(deliveries
            .into_iter()
            .filter(|delivery| *delivery == Delivery::Acknowledged)
            .count())
    }

    async fn dead_letter(
        &self,
        key: &TopicGroup,
        pending: &PendingEntry,
    ) -> Result<Option<TransportMessage>, GatewayError> {
        let gateway = self.dispatcher.gateway();
        let id = &pending.id;

        let entry = match gateway.fetch_entry(&key.topic, &key.group, id).await? {
            Some(entry) => entry,
            None => {
                warn!(%key, entry_id = %id, "Pending entry no longer exists, acknowledging it");
                gateway.acknowledge(&key.topic, &key.group, id).await?;
                return Ok(None);
            }
        };

        let raw_body = entry.fields.get(FIELD_BODY).cloned().unwrap_or_default();
        let message = match TransportMessage::from_entry(entry, &key.topic) {
            Ok(message) => message,
            Err(e) => {
                warn!(%key, entry_id = %id, error = %e, "Dead-lettering entry with unreadable headers");
                TransportMessage::new(key.topic.clone(), Headers::new(), raw_body)
            }
        };

        let reason = format!(
            "delivery failed {} times, exceeding the retry ceiling of {}",
            pending.deliveries, self.policy.ceiling
        );

        let mut letter = message.to_dead_letter(&reason);
        letter.set_header(headers::GROUP, key.group.clone());

        if gateway
            .move_to_dead_letter(&key.topic, &key.group, id, &letter)
            .await?
        {
            info!(%key, entry_id = %id, deliveries = pending.deliveries, "Moved entry to dead-letter stream");
            Ok(Some(message))
        } else {
            debug!(%key, entry_id = %id, "Entry has been resolved concurrently");
            Ok(None)
        }
    }

    async fn notify(&self, letters: Vec<TransportMessage>) {
        let callback = match self.on_failure.as_ref() {
            Some(callback) => callback,
            None => return,
        };

        futures::stream::iter(letters)
            .for_each_concurrent(self.policy.callback_concurrency.max(1), |message| {
                let id = message.id();
                let task = tokio::spawn(callback(message));

                async move {
                    match task.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(entry_id = ?id, error = %e, "Failure callback returned an error"),
                        Err(e) => error!(entry_id = ?id, error = %e, "Failure callback panicked"),
                    }
                }
            })
            .await;
    }
}

#[async_trait]
impl Processor for PendingRetryProcessor {
    const NAME: &'static str = "PendingRetry";

    async fn run(&self, ctx: ProcessingContext) -> ProcessorResult {
        loop {
            ctx.throw_if_stopping()?;

            let report = self.scan().await;
            if report != ScanReport::default() {
                debug!(?report, "Completed pending entry scan");
            }

            ctx.wait(self.policy.interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::communication::implementation::memory::MemoryStreamGateway;
    use crate::library::communication::{dead_letter_topic, Codec, StreamGateway};
    use crate::module::delivery::{handler_fn, HandlerRegistry, Subscription};
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const TOPIC: &str = "orders";
    const GROUP: &str = "billing";

    fn policy() -> RetryPolicy {
        RetryPolicy {
            idle_threshold: Duration::ZERO,
            ceiling: 2,
            interval: Duration::from_millis(10),
            callback_concurrency: 4,
        }
    }

    async fn setup(
        healthy: Arc<AtomicBool>,
        on_failure: Option<FailureCallback>,
    ) -> (Arc<MemoryStreamGateway>, PendingRetryProcessor) {
        let registry = HandlerRegistry::builder()
            .subscribe(
                Subscription::new(TOPIC, GROUP),
                handler_fn(move |_: Value, _| {
                    let healthy = healthy.load(Ordering::SeqCst);
                    async move {
                        let result: EmptyResult = if healthy {
                            Ok(())
                        } else {
                            Err("handler down".into())
                        };
                        result
                    }
                }),
            )
            .build()
            .unwrap();

        let registry = Arc::new(registry);
        let gateway = Arc::new(MemoryStreamGateway::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            gateway.clone(),
            Codec::Json,
            "c1",
        ));
        dispatcher.prepare().await.unwrap();

        let info = StreamInfoRegistry::resolve(&registry, gateway.as_ref()).await;
        let processor = PendingRetryProcessor::new(dispatcher, info, policy(), on_failure);

        (gateway, processor)
    }

    async fn publish_and_fail(gateway: &MemoryStreamGateway) {
        let message = TransportMessage::new(TOPIC, Headers::new(), b"{\"amount\":1}".to_vec());
        gateway.append(TOPIC, &message, None).await.unwrap();
        gateway
            .read_new(TOPIC, GROUP, "c0", 10, Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_pending_lists_are_a_no_op() {
        let (_, processor) = setup(Arc::new(AtomicBool::new(true)), None).await;

        let report = processor.scan().await;
        assert_eq!(
            report,
            ScanReport {
                pairs_scanned: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn stalled_entries_are_redelivered() {
        let (gateway, processor) = setup(Arc::new(AtomicBool::new(true)), None).await;
        publish_and_fail(&gateway).await;

        let report = processor.scan().await;
        assert_eq!(report.redelivered, 1);
        assert_eq!(gateway.pending_count(TOPIC, GROUP), 0);
    }

    #[tokio::test]
    async fn exhausted_entries_are_dead_lettered_once() {
        let notified = Arc::new(AtomicUsize::new(0));
        let callback = {
            let notified = notified.clone();
            failure_callback(move |message: TransportMessage| {
                let notified = notified.clone();
                async move {
                    assert_eq!(message.body(), b"{\"amount\":1}");
                    notified.fetch_add(1, Ordering::SeqCst);
                    let result: EmptyResult = Ok(());
                    result
                }
            })
        };

        let (gateway, processor) = setup(Arc::new(AtomicBool::new(false)), Some(callback)).await;
        publish_and_fail(&gateway).await;

        // Deliveries two and three happen through claims, the third scan finds it above the ceiling
        for _ in 0..2 {
            assert_eq!(processor.scan().await.dead_lettered, 0);
        }

        assert_eq!(processor.scan().await.dead_lettered, 1);
        assert_eq!(processor.scan().await.dead_lettered, 0);

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.pending_count(TOPIC, GROUP), 0);
        assert_eq!(gateway.entries(&dead_letter_topic(TOPIC)).len(), 1);
    }

    #[tokio::test]
    async fn callback_failures_are_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let callback = {
            let calls = calls.clone();
            failure_callback(move |_message: TransportMessage| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        panic!("callback exploded");
                    }
                    let result: EmptyResult = Err("callback failed".into());
                    result
                }
            })
        };

        let (gateway, processor) = setup(Arc::new(AtomicBool::new(false)), Some(callback)).await;
        publish_and_fail(&gateway).await;
        publish_and_fail(&gateway).await;

        let mut dead_lettered = 0;
        for _ in 0..3 {
            dead_lettered += processor.scan().await.dead_lettered;
        }

        assert_eq!(dead_lettered, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
