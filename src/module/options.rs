//! Various options usable by modules
//!
//! The structs in this module allow binaries to flatten them into
//! their own options struct. This allows for a unified yet non-cluttered
//! option set.

use crate::library::communication::implementation::redis::RedisConnector;
use crate::library::helpers::parse_seconds;
use redis::RedisResult;
use std::time::Duration;
use structopt::StructOpt;

/// Options for connecting to the Redis server
#[derive(Debug, Clone, StructOpt)]
pub struct RedisOptions {
    /// Redis database server URL
    #[structopt(
        short = "r",
        long = "redis",
        env = "REDIS",
        global = true,
        default_value = "redis://127.0.0.1/",
        value_name = "url"
    )]
    pub url: String,

    /// Seconds a single connection attempt may take
    #[structopt(long, env = "REDIS_CONNECT_TIMEOUT", global = true, default_value = "4", parse(try_from_str = parse_seconds))]
    pub connect_timeout: Duration,

    /// Number of times a failed connection attempt is retried before the operation fails
    #[structopt(long, env = "REDIS_CONNECT_RETRIES", global = true, default_value = "4")]
    pub connect_retries: u32,
}

impl RedisOptions {
    /// Creates a connector for pooled connections to the configured server
    pub fn connector(&self) -> RedisResult<RedisConnector> {
        Ok(RedisConnector::new(&self.url)?.with_attempts(self.connect_timeout, self.connect_retries))
    }
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".into(),
            connect_timeout: Duration::from_secs(4),
            connect_retries: 4,
        }
    }
}
