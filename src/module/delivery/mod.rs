//! Reliable at-least-once delivery on top of a [`StreamGateway`](crate::library::communication::StreamGateway)
//!
//! Messages flow from the [`Publisher`] through the gateway into the log store. For every
//! registered (topic, group) pair a [`ConsumerReader`] reads new entries, the [`Dispatcher`] hands
//! them to the best matching handler and acknowledges them once it succeeded. Entries whose handler
//! failed stay pending. The [`PendingRetryProcessor`] periodically claims and redelivers them, and
//! moves entries that exhausted their retry budget to the dead-letter stream of their topic while
//! notifying the failure callback.
//!
//! The [`Engine`] wires all of this up:
//!
//! ```no_run
//! # use redismq::module::delivery::*;
//! # use redismq::library::communication::implementation::memory::MemoryStreamGateway;
//! # use redismq::library::EmptyResult;
//! # use std::sync::Arc;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = HandlerRegistry::builder()
//!     .subscribe(
//!         Subscription::new("orders", "billing"),
//!         handler_fn(|order: serde_json::Value, _message| async move {
//!             println!("{}", order);
//!             let result: EmptyResult = Ok(());
//!             result
//!         }),
//!     )
//!     .build()?;
//!
//! let engine = Engine::builder(DeliveryOptions::default())
//!     .registry(registry)
//!     .on_failure(|message| async move {
//!         eprintln!("gave up on {:?}", message.id());
//!         let result: EmptyResult = Ok(());
//!         result
//!     })
//!     .start(Arc::new(MemoryStreamGateway::new()))
//!     .await?;
//!
//! engine.publisher().publish("orders", &serde_json::json!({ "amount": 5 })).await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod dispatcher;
mod engine;
mod health;
mod options;
mod publisher;
mod registry;
mod retry;
mod stream_info;

pub use dispatcher::{ConsumerReader, Delivery, Dispatcher};
pub use engine::{Engine, EngineBuilder, EngineError};
pub use health::{ConnectionCapacityProcessor, TransportCheckProcessor};
pub use options::DeliveryOptions;
pub use publisher::{PublishError, Publisher};
pub use registry::{
    handler_fn, FnHandler, Handler, HandlerDescriptor, HandlerRegistry, HandlerRegistryBuilder,
    InvocationError, RegistryError, Subscription, SubscriptionOptions, TopicGroup,
};
pub use retry::{failure_callback, FailureCallback, PendingRetryProcessor, RetryPolicy, ScanReport};
pub use stream_info::StreamInfoRegistry;
