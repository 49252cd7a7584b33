use anyhow::Result;
use options::{Command, ConsumeOptions, LogFormat, PublishOptions};
use redismq::library::communication::implementation::redis::RedisStreamGateway;
use redismq::library::communication::{headers, Codec, Headers, TransportMessage};
use redismq::library::EmptyResult;
use redismq::module::delivery::{
    handler_fn, ConnectionCapacityProcessor, DeliveryOptions, Engine, HandlerRegistry, Publisher,
    Subscription,
};
use serde_json::Value;
use std::sync::Arc;
use structopt::StructOpt;
use tracing::{error, info};

mod options;

#[tokio::main]
async fn main() -> Result<()> {
    let options = options::MainOptions::from_args();
    init(&options);

    let delivery = options.delivery;
    let gateway = RedisStreamGateway::open(
        options.redis.connector()?,
        delivery.pool_size,
        delivery.blocking_pool_size,
        delivery.lease_policy,
    )
    .with_group_start(delivery.group_start);
    let gateway = Arc::new(gateway);

    match options.command {
        Command::Publish(publish_options) => publish(gateway, delivery, publish_options).await,
        Command::Consume(consume_options) => consume(gateway, delivery, consume_options).await,
    }
}

fn init(options: &options::MainOptions) {
    let formatter = tracing_subscriber::fmt().with_env_filter(options.log.as_str());

    match options.log_format {
        LogFormat::Text => formatter.init(),
        LogFormat::Compact => formatter.compact().init(),
        LogFormat::Json => formatter.json().init(),
    };

    info!("redismq {}", env!("CARGO_PKG_VERSION"));
}

async fn publish(
    gateway: Arc<RedisStreamGateway>,
    delivery: DeliveryOptions,
    options: PublishOptions,
) -> Result<()> {
    let publisher = Publisher::new(gateway, Codec::Json).with_max_len(delivery.stream_max_len);
    let payload: Value = serde_json::from_str(&options.payload)?;

    let mut custom = Headers::new();
    if let Some(name) = options.name {
        custom.insert(headers::MESSAGE_NAME.into(), Some(name));
    }
    if let Some(correlation_id) = options.correlation_id {
        custom.insert(headers::CORRELATION_ID.into(), Some(correlation_id));
    }

    for _ in 0..options.count {
        let id = publisher
            .publish_with_headers(&options.topic, &payload, custom.clone())
            .await?;

        info!(topic = %options.topic, entry_id = %id, "Published message");
    }

    Ok(())
}

async fn handle(payload: Value, message: TransportMessage, reject: bool) -> EmptyResult {
    info!(
        topic = message.topic(),
        entry_id = ?message.id(),
        name = message.name(),
        %payload,
        "Received message"
    );

    if reject {
        Err("message rejected on request".into())
    } else {
        Ok(())
    }
}

async fn report(message: TransportMessage) -> EmptyResult {
    error!(
        topic = message.topic(),
        entry_id = ?message.id(),
        message_id = ?message.message_id(),
        "Message moved to dead-letter stream"
    );

    Ok(())
}

async fn consume(
    gateway: Arc<RedisStreamGateway>,
    delivery: DeliveryOptions,
    options: ConsumeOptions,
) -> Result<()> {
    let reject = options.reject;
    let mut registry = HandlerRegistry::builder();

    for topic in options.topics.iter() {
        registry = registry.subscribe(
            Subscription::new(topic.as_str(), options.group.as_str()),
            handler_fn(move |payload: Value, message| handle(payload, message, reject)),
        );
    }

    let capacity_check_interval = delivery.capacity_check_interval;
    let engine = Engine::builder(delivery)
        .registry(registry.build()?)
        .on_failure(report)
        .start(gateway.clone())
        .await?;

    engine
        .spawn(ConnectionCapacityProcessor::new(
            gateway,
            capacity_check_interval,
        ))
        .await;

    tokio::signal::ctrl_c().await?;
    info!("Received interrupt, shutting down");

    engine.shutdown().await;

    Ok(())
}
