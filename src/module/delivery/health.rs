use crate::harness::{ProcessingContext, Processor, ProcessorResult};
use crate::library::communication::StreamGateway;
use crate::library::pool::Replenish;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CONSECUTIVE_FAILURE_THRESHOLD: u64 = 3;

/// Periodically verifies that the log store is reachable
pub struct TransportCheckProcessor {
    gateway: Arc<dyn StreamGateway>,
    interval: Duration,
    failures: AtomicU64,
}

impl TransportCheckProcessor {
    /// Creates a new check running every `interval`
    pub fn new(gateway: Arc<dyn StreamGateway>, interval: Duration) -> Self {
        Self {
            gateway,
            interval,
            failures: AtomicU64::new(0),
        }
    }

    /// Pings the log store once, returns whether it responded
    pub async fn check(&self) -> bool {
        match self.gateway.ping().await {
            Ok(()) => {
                let previous = self.failures.swap(0, Ordering::Relaxed);
                if previous > 0 {
                    info!(failures = previous, "Transport recovered");
                }
                true
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;

                if failures >= CONSECUTIVE_FAILURE_THRESHOLD {
                    error!(failures, error = %e, "Transport unavailable");
                } else {
                    warn!(failures, error = %e, "Transport check failed");
                }

                false
            }
        }
    }

    /// Number of checks that failed in a row
    pub fn consecutive_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Processor for TransportCheckProcessor {
    const NAME: &'static str = "TransportCheck";

    async fn run(&self, ctx: ProcessingContext) -> ProcessorResult {
        loop {
            ctx.throw_if_stopping()?;
            self.check().await;
            ctx.wait(self.interval).await?;
        }
    }
}

/// Periodically re-establishes vacant pooled connections ahead of demand
pub struct ConnectionCapacityProcessor {
    pools: Arc<dyn Replenish>,
    interval: Duration,
}

impl ConnectionCapacityProcessor {
    /// Creates a new check running every `interval`
    pub fn new(pools: Arc<dyn Replenish>, interval: Duration) -> Self {
        Self { pools, interval }
    }

    /// Refills all pools once and returns the number of new connections
    pub async fn check(&self) -> usize {
        let connected = self.pools.replenish().await;

        for (index, status) in self.pools.capacity().into_iter().enumerate() {
            if status.vacant > 0 {
                warn!(pool = index, vacant = status.vacant, size = status.size, "Connection pool is below capacity");
            } else {
                debug!(pool = index, idle = status.idle, leased = status.leased, connects = status.connects, discarded = status.discarded, "Connection pool status");
            }
        }

        if connected > 0 {
            info!(connected, "Re-established pooled connections");
        }

        connected
    }
}

#[async_trait]
impl Processor for ConnectionCapacityProcessor {
    const NAME: &'static str = "ConnectionCapacity";

    async fn run(&self, ctx: ProcessingContext) -> ProcessorResult {
        loop {
            ctx.throw_if_stopping()?;
            self.check().await;
            ctx.wait(self.interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::communication::implementation::memory::MemoryStreamGateway;
    use crate::library::pool::{ConnectionFactory, ConnectionPool, LeasePolicy};
    use crate::library::BoxedError;

    struct Numbers;

    #[async_trait]
    impl ConnectionFactory for Numbers {
        type Connection = u8;

        async fn connect(&self) -> Result<u8, BoxedError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn transport_check_pings_gateway() {
        let gateway = Arc::new(MemoryStreamGateway::new());
        let processor = TransportCheckProcessor::new(gateway.clone(), Duration::from_secs(30));

        assert!(processor.check().await);
        assert_eq!(processor.consecutive_failures(), 0);
        assert_eq!(gateway.pings(), 1);
    }

    #[tokio::test]
    async fn capacity_check_fills_vacant_slots() {
        let pool = Arc::new(ConnectionPool::new(Numbers, 3, LeasePolicy::RoundRobin));
        let processor = ConnectionCapacityProcessor::new(pool.clone(), Duration::from_secs(60));

        assert_eq!(processor.check().await, 3);
        assert_eq!(processor.check().await, 0);
        assert_eq!(pool.status().idle, 3);
    }
}
