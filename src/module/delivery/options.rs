use crate::library::communication::QueueLocation;
use crate::library::helpers::{parse_millis, parse_seconds};
use crate::library::pool::LeasePolicy;
use std::time::Duration;
use structopt::StructOpt;
use uuid::Uuid;

/// Options of the delivery engine
#[derive(Debug, Clone, StructOpt)]
pub struct DeliveryOptions {
    /// Number of connections used for regular commands like publishing and acknowledging
    #[structopt(long, env, default_value = "5")]
    pub pool_size: usize,

    /// Number of connections reserved for blocking reads, should be at least the number of consumed topics
    #[structopt(long, env, default_value = "5")]
    pub blocking_pool_size: usize,

    /// Strategy used to distribute operations over pooled connections [round-robin, sequential, random]
    #[structopt(long, env, default_value = "round-robin")]
    pub lease_policy: LeasePolicy,

    /// Time (in seconds) an entry has to be pending before it becomes eligible for a retry
    #[structopt(long, env, default_value = "15", parse(try_from_str = parse_seconds))]
    pub retry_idle_threshold: Duration,

    /// Number of deliveries after which a pending entry is moved to the dead-letter stream
    #[structopt(long, env, default_value = "3")]
    pub retry_ceiling: u64,

    /// Interval (in seconds) between two scans of the pending entries
    #[structopt(long, env, default_value = "15", parse(try_from_str = parse_seconds))]
    pub retry_interval: Duration,

    /// Interval (in seconds) between two checks of the transport health
    #[structopt(long, env, default_value = "30", parse(try_from_str = parse_seconds))]
    pub transport_check_interval: Duration,

    /// Interval (in seconds) between two refills of vacant connection slots
    #[structopt(long, env, default_value = "60", parse(try_from_str = parse_seconds))]
    pub capacity_check_interval: Duration,

    /// Maximum time (in milliseconds) a reader blocks while waiting for new entries
    #[structopt(long, env, default_value = "2000", parse(try_from_str = parse_millis))]
    pub poll_timeout: Duration,

    /// Maximum number of entries fetched by one read
    #[structopt(long, env, default_value = "10")]
    pub batch_size: usize,

    /// Maximum number of failure callbacks running in parallel
    #[structopt(long, env, default_value = "8")]
    pub callback_concurrency: usize,

    /// Name of this consumer within its groups, a random one is generated when omitted.
    /// Keeping it stable across restarts lets an instance resume its own pending entries.
    #[structopt(long, env = "CONSUMER_NAME")]
    pub consumer: Option<String>,

    /// Approximate number of entries to retain per topic when publishing, unbounded when omitted
    #[structopt(long, env)]
    pub stream_max_len: Option<usize>,

    /// Position from which newly created consumer groups start reading [head, tail]
    #[structopt(long, env, default_value = "head")]
    pub group_start: QueueLocation,

    /// Time (in seconds) processors are given to stop before they are aborted
    #[structopt(long, env, default_value = "30", parse(try_from_str = parse_seconds))]
    pub shutdown_timeout: Duration,
}

impl DeliveryOptions {
    /// Configured consumer name or a freshly generated one
    pub fn consumer_name(&self) -> String {
        self.consumer
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()))
    }
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            pool_size: 5,
            blocking_pool_size: 5,
            lease_policy: LeasePolicy::RoundRobin,
            retry_idle_threshold: Duration::from_secs(15),
            retry_ceiling: 3,
            retry_interval: Duration::from_secs(15),
            transport_check_interval: Duration::from_secs(30),
            capacity_check_interval: Duration::from_secs(60),
            poll_timeout: Duration::from_millis(2000),
            batch_size: 10,
            callback_concurrency: 8,
            consumer: None,
            stream_max_len: None,
            group_start: QueueLocation::Head,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_command_line() {
        let parsed = DeliveryOptions::from_iter_safe(&["test"]).unwrap();
        let defaults = DeliveryOptions::default();

        assert_eq!(parsed.pool_size, defaults.pool_size);
        assert_eq!(parsed.lease_policy, defaults.lease_policy);
        assert_eq!(parsed.retry_idle_threshold, defaults.retry_idle_threshold);
        assert_eq!(parsed.retry_ceiling, defaults.retry_ceiling);
        assert_eq!(parsed.poll_timeout, defaults.poll_timeout);
        assert_eq!(parsed.group_start, defaults.group_start);
        assert_eq!(parsed.shutdown_timeout, defaults.shutdown_timeout);
    }

    #[test]
    fn generated_consumer_names_are_unique() {
        let options = DeliveryOptions::default();
        assert_ne!(options.consumer_name(), options.consumer_name());

        let named = DeliveryOptions {
            consumer: Some("worker-1".into()),
            ..Default::default()
        };
        assert_eq!(named.consumer_name(), "worker-1");
    }
}
