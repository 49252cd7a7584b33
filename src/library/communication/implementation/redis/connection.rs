use crate::library::helpers::Backoff;
use crate::library::pool::{ConnectionFactory, PooledConnection};
use crate::library::BoxedError;
use async_trait::async_trait;
use futures::FutureExt;
use redis::aio::{Connection, ConnectionLike};
use redis::{Client, Cmd, Pipeline, RedisError, RedisFuture, RedisResult, Value};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{instrument, trace, warn};

/// Marks the lease as broken when a command failed due to a transport-level problem
macro_rules! mark_if_disconnected {
    ($self:expr, $result:expr) => {
        if let Err(ref e) = $result {
            if is_transport_error(e) {
                warn!(slot = $self.slot(), error = %e, "Redis connection failed, scheduling reconnect");
                $self.mark_broken();
            }
        }
    };
}

fn is_transport_error(error: &RedisError) -> bool {
    error.is_connection_dropped()
        || error.is_io_error()
        || error.is_connection_refusal()
        || error.is_timeout()
}

impl<C: ConnectionLike + Send> ConnectionLike for PooledConnection<C> {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        (async move {
            let result = (**self).req_packed_command(cmd).await;
            mark_if_disconnected!(self, result);
            result
        })
        .boxed()
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        (async move {
            let result = (**self).req_packed_commands(cmd, offset, count).await;
            mark_if_disconnected!(self, result);
            result
        })
        .boxed()
    }

    fn get_db(&self) -> i64 {
        (**self).get_db()
    }
}

/// [`ConnectionFactory`] opening standalone connections to a redis server
///
/// Every connection attempt is bounded by a timeout and retried with an exponential backoff
/// a limited number of times before the error is reported to the pool.
#[derive(Clone)]
pub struct RedisConnector {
    client: Client,
    attempt_timeout: Duration,
    backoff: Backoff,
}

impl RedisConnector {
    /// Creates a new connector for the given URL
    pub fn new(url: &str) -> RedisResult<Self> {
        Ok(Self {
            client: Client::open(url)?,
            attempt_timeout: Duration::from_secs(4),
            backoff: Backoff::new(Duration::from_millis(100), 4).with_ceiling(Duration::from_secs(2)),
        })
    }

    /// Bounds every connection attempt by `attempt_timeout` and retries failed attempts up to `retries` times
    pub fn with_attempts(mut self, attempt_timeout: Duration, retries: u32) -> Self {
        self.attempt_timeout = attempt_timeout;
        self.backoff = Backoff::new(Duration::from_millis(100), retries).with_ceiling(Duration::from_secs(2));
        self
    }

    async fn attempt(&self) -> Result<Connection, BoxedError> {
        match timeout(self.attempt_timeout, self.client.get_async_connection()).await {
            Ok(result) => Ok(result?),
            Err(elapsed) => Err(elapsed.into()),
        }
    }
}

#[async_trait]
impl ConnectionFactory for RedisConnector {
    type Connection = Connection;

    #[instrument(skip(self))]
    async fn connect(&self) -> Result<Connection, BoxedError> {
        let mut backoff = self.backoff.clone();
        let mut attempt = 0;

        loop {
            trace!(attempt, "Connecting to redis");

            match self.attempt().await {
                Ok(connection) => return Ok(connection),
                Err(error) => match backoff.next() {
                    Some(delay) => {
                        warn!(%error, attempt, "Failed to connect to redis, retrying");
                        sleep(delay).await;
                    }
                    None => return Err(error),
                },
            }

            attempt += 1;
        }
    }
}
