use super::{
    failure_callback, DeliveryOptions, Dispatcher, FailureCallback, HandlerRegistry,
    PendingRetryProcessor, Publisher, RegistryError, RetryPolicy, StreamInfoRegistry,
    TransportCheckProcessor,
};
use crate::harness::{Processor, ProcessorScheduler, ProcessorStatus};
use crate::library::communication::{Codec, GatewayError, StreamGateway, TransportMessage};
use crate::library::EmptyResult;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Errors preventing the engine from starting
#[derive(Debug, Error)]
pub enum EngineError {
    /// Handler registrations are invalid
    #[error("invalid handler registry")]
    Registry(#[from] RegistryError),
    /// Log store could not be prepared
    #[error("unable to prepare consumer groups")]
    Gateway(#[from] GatewayError),
    /// Some topics of a group could not be subscribed to
    #[error("topics {topics:?} of group '{group}' could not be resolved")]
    UnresolvedTopics {
        /// Group that has been resolved
        group: String,
        /// Topics missing from the resolution
        topics: Vec<String>,
    },
}

/// Configures and starts an [`Engine`]
pub struct EngineBuilder {
    options: DeliveryOptions,
    registry: HandlerRegistry,
    codec: Codec,
    on_failure: Option<FailureCallback>,
}

impl EngineBuilder {
    /// Sets the handlers to dispatch to
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the default codec used for publishing and for messages without a content type
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the callback invoked for every dead-lettered message
    pub fn on_failure<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(TransportMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EmptyResult> + Send + 'static,
    {
        self.on_failure = Some(failure_callback(callback));
        self
    }

    /// Validates the configuration, prepares all consumer groups and starts the processors
    ///
    /// Topics of every registered group have to resolve, otherwise starting fails. The snapshot
    /// used by the pending-retry processor is built afterwards with per-group isolation.
    #[instrument(skip(self, gateway))]
    pub async fn start<G>(self, gateway: Arc<G>) -> Result<Engine, EngineError>
    where
        G: StreamGateway + 'static,
    {
        let gateway: Arc<dyn StreamGateway> = gateway;
        let options = self.options;
        let registry = Arc::new(self.registry);

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            gateway.clone(),
            self.codec,
            options.consumer_name(),
        ));

        let keys = dispatcher.prepare().await?;
        let stream_info = StreamInfoRegistry::resolve(&registry, gateway.as_ref()).await;

        let scheduler = ProcessorScheduler::new();

        for reader in dispatcher.readers(&keys, options.batch_size, options.poll_timeout) {
            scheduler.spawn(reader).await;
        }

        if !registry.is_empty() {
            let retry = PendingRetryProcessor::new(
                dispatcher.clone(),
                stream_info,
                RetryPolicy::from(&options),
                self.on_failure,
            );

            scheduler.spawn(retry).await;
        }

        let transport_check =
            TransportCheckProcessor::new(gateway.clone(), options.transport_check_interval);
        scheduler.spawn(transport_check).await;

        let publisher = Publisher::new(gateway, self.codec).with_max_len(options.stream_max_len);

        info!(consumer = dispatcher.consumer(), readers = keys.len(), "Delivery engine started");

        Ok(Engine {
            options,
            scheduler,
            dispatcher,
            publisher,
        })
    }
}

/// Running delivery engine
pub struct Engine {
    options: DeliveryOptions,
    scheduler: ProcessorScheduler,
    dispatcher: Arc<Dispatcher>,
    publisher: Publisher,
}

impl Engine {
    /// Starts configuring a new engine
    pub fn builder(options: DeliveryOptions) -> EngineBuilder {
        EngineBuilder {
            options,
            registry: HandlerRegistry::default(),
            codec: Codec::default(),
            on_failure: None,
        }
    }

    /// Publisher appending to the same log store the engine consumes
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Dispatcher routing entries to the registered handlers
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Runs an additional processor alongside the built-in ones
    pub async fn spawn<P: Processor + 'static>(&self, processor: P) -> String {
        self.scheduler.spawn(processor).await
    }

    /// Current status of all processors
    pub async fn status(&self) -> HashMap<String, ProcessorStatus> {
        self.scheduler.status().await
    }

    /// Stops all processors, waiting up to the configured shutdown timeout
    ///
    /// Processors are not restarted after a failure, those are reported with [`ProcessorStatus::Failed`].
    #[instrument(skip(self))]
    pub async fn shutdown(self) -> HashMap<String, ProcessorStatus> {
        let status = self.scheduler.shutdown(self.options.shutdown_timeout).await;

        for (name, state) in status.iter() {
            if *state != ProcessorStatus::Stopped {
                warn!(processor = %name, status = %state, "Processor did not stop cleanly");
            }
        }

        info!("Delivery engine stopped");
        status
    }
}
