//! Fixed-size pool of exclusively leased connections
//!
//! A single connection serializes every command sent over it. Under concurrent load one slow
//! operation would thus delay all unrelated ones queued behind it. The [`ConnectionPool`] spreads
//! operations over a fixed number of physical connections instead, handing out one per logical
//! operation according to a [`LeasePolicy`].
//!
//! Leasing waits while all connections are in use. A lease that observed a transport failure is
//! marked as broken and its slot is vacated on release so that the next lease transparently
//! reconnects. The failing operation itself still reports its error to the caller, the pool never
//! retries on anybody's behalf.

mod lease;
mod policy;

pub use lease::PooledConnection;
pub use policy::LeasePolicy;

use crate::library::BoxedError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, instrument, warn};

/// Errors that may occur while leasing a connection
#[derive(Debug, Error)]
pub enum PoolError {
    /// Establishing a connection for a vacant slot failed
    #[error("unable to connect slot {slot}")]
    Connect {
        /// Index of the slot
        slot: usize,
        /// Error returned by the [`ConnectionFactory`]
        #[source]
        source: BoxedError,
    },
    /// Pool has been closed and does not hand out connections anymore
    #[error("connection pool has been closed")]
    Closed,
}

/// Establishes new physical connections for a [`ConnectionPool`]
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Type of connection created
    type Connection: Send + 'static;

    /// Opens a new connection
    async fn connect(&self) -> Result<Self::Connection, BoxedError>;
}

/// Point-in-time view of the pool's slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatus {
    /// Total number of slots
    pub size: usize,
    /// Slots currently leased
    pub leased: usize,
    /// Slots holding an idle, established connection
    pub idle: usize,
    /// Slots without a connection which will connect on their next lease
    pub vacant: usize,
    /// Connections established over the lifetime of the pool
    pub connects: u64,
    /// Connections discarded after a transport failure
    pub discarded: u64,
}

/// Anything holding pooled connections that can be topped up ahead of demand
#[async_trait]
pub trait Replenish: Send + Sync {
    /// Re-establishes vacant connections, returning how many have been connected
    async fn replenish(&self) -> usize;

    /// Status of every underlying pool
    fn capacity(&self) -> Vec<PoolStatus>;
}

type Slot<C> = Arc<Mutex<Option<C>>>;

pub(crate) struct PoolCounters {
    connects: AtomicU64,
    discarded: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    slots: Vec<Slot<F::Connection>>,
    permits: Arc<Semaphore>,
    policy: LeasePolicy,
    cursor: AtomicUsize,
    counters: Arc<PoolCounters>,
}

/// Pool of `size` connections created by a [`ConnectionFactory`]
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Creates a new pool with `size` vacant slots, connections are established lazily
    pub fn new(factory: F, size: usize, policy: LeasePolicy) -> Self {
        let size = size.max(1);
        let slots = (0..size).map(|_| Arc::new(Mutex::new(None))).collect();

        Self {
            inner: Arc::new(PoolInner {
                factory,
                slots,
                permits: Arc::new(Semaphore::new(size)),
                policy,
                cursor: AtomicUsize::new(0),
                counters: Arc::new(PoolCounters {
                    connects: AtomicU64::new(0),
                    discarded: AtomicU64::new(0),
                }),
            }),
        }
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.inner.slots.len()
    }

    /// Leases a connection for one logical operation
    ///
    /// Waits until a slot becomes available if all of them are currently leased.
    pub async fn lease(&self) -> Result<PooledConnection<F::Connection>, PoolError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let size = self.size();

        // Slots are only locked by permit holders, a free one shows up once concurrent status checks let go
        loop {
            let start = self.inner.policy.start(&self.inner.cursor, size);

            for offset in 0..size {
                let slot = (start + offset) % size;

                if let Ok(guard) = self.inner.slots[slot].clone().try_lock_owned() {
                    return self.prepare(slot, guard, permit).await;
                }
            }

            tokio::task::yield_now().await;
        }
    }

    async fn prepare(
        &self,
        slot: usize,
        mut guard: OwnedMutexGuard<Option<F::Connection>>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> Result<PooledConnection<F::Connection>, PoolError> {
        let connection = match guard.take() {
            Some(connection) => connection,
            None => self.connect(slot).await?,
        };

        Ok(PooledConnection::new(
            slot,
            connection,
            guard,
            permit,
            self.inner.counters.clone(),
        ))
    }

    #[instrument(skip(self))]
    async fn connect(&self, slot: usize) -> Result<F::Connection, PoolError> {
        match self.inner.factory.connect().await {
            Ok(connection) => {
                self.inner.counters.connects.fetch_add(1, Ordering::Relaxed);
                debug!(slot, "Established pooled connection");
                Ok(connection)
            }
            Err(source) => {
                warn!(slot, error = %source, "Failed to establish pooled connection");
                Err(PoolError::Connect { slot, source })
            }
        }
    }

    /// Establishes connections for all vacant slots that are not currently leased
    ///
    /// Returns the number of slots that have been (re-)connected. Failures are logged and leave the
    /// slot vacant. Stops early when every connection is leased.
    pub async fn refill(&self) -> usize {
        let mut connected = 0;

        for (slot, cell) in self.inner.slots.iter().enumerate() {
            let _permit = match self.inner.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let mut guard = match cell.clone().try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => continue,
            };

            if guard.is_none() {
                if let Ok(connection) = self.connect(slot).await {
                    *guard = Some(connection);
                    connected += 1;
                }
            }
        }

        connected
    }

    /// Inspects the current state of all slots without waiting for any of them
    pub fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            size: self.size(),
            connects: self.inner.counters.connects.load(Ordering::Relaxed),
            discarded: self.inner.counters.discarded.load(Ordering::Relaxed),
            ..Default::default()
        };

        for cell in self.inner.slots.iter() {
            match cell.try_lock() {
                Ok(guard) if guard.is_some() => status.idle += 1,
                Ok(_) => status.vacant += 1,
                Err(_) => status.leased += 1,
            }
        }

        status
    }

    /// Stops handing out connections, pending and future leases fail with [`PoolError::Closed`]
    pub fn close(&self) {
        self.inner.permits.close();
    }
}

#[async_trait]
impl<F: ConnectionFactory> Replenish for ConnectionPool<F> {
    async fn replenish(&self) -> usize {
        self.refill().await
    }

    fn capacity(&self) -> Vec<PoolStatus> {
        vec![self.status()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::time::timeout;

    struct CountingFactory {
        created: AtomicUsize,
        failing: AtomicBool,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for Arc<CountingFactory> {
        type Connection = usize;

        async fn connect(&self) -> Result<usize, BoxedError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err("connection refused".into());
            }

            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn round_robin_spreads_leases() {
        let factory = Arc::new(CountingFactory::new());
        let pool = ConnectionPool::new(factory.clone(), 3, LeasePolicy::RoundRobin);

        let mut slots = Vec::new();
        for _ in 0..3 {
            let lease = pool.lease().await.unwrap();
            slots.push(lease.slot());
        }

        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connections_are_reused_after_release() {
        let factory = Arc::new(CountingFactory::new());
        let pool = ConnectionPool::new(factory.clone(), 1, LeasePolicy::RoundRobin);

        let first = *pool.lease().await.unwrap();
        let second = *pool.lease().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn lease_waits_for_capacity() {
        let pool = ConnectionPool::new(Arc::new(CountingFactory::new()), 2, LeasePolicy::Sequential);

        let a = pool.lease().await.unwrap();
        let _b = pool.lease().await.unwrap();
        assert_eq!(pool.status().leased, 2);

        let waiting = timeout(Duration::from_millis(20), pool.lease()).await;
        assert!(waiting.is_err());

        let released_slot = a.slot();
        drop(a);

        let c = timeout(Duration::from_millis(100), pool.lease())
            .await
            .expect("lease did not resume after release")
            .unwrap();
        assert_eq!(c.slot(), released_slot);
    }

    #[tokio::test]
    async fn broken_connections_are_replaced() {
        let factory = Arc::new(CountingFactory::new());
        let pool = ConnectionPool::new(factory.clone(), 1, LeasePolicy::RoundRobin);

        let mut lease = pool.lease().await.unwrap();
        assert_eq!(*lease, 0);
        lease.mark_broken();
        drop(lease);

        let status = pool.status();
        assert_eq!(status.vacant, 1);
        assert_eq!(status.discarded, 1);

        let lease = pool.lease().await.unwrap();
        assert_eq!(*lease, 1);
    }

    #[tokio::test]
    async fn connect_failures_surface_and_leave_slot_vacant() {
        let factory = Arc::new(CountingFactory::new());
        let pool = ConnectionPool::new(factory.clone(), 1, LeasePolicy::RoundRobin);

        factory.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            pool.lease().await,
            Err(PoolError::Connect { slot: 0, .. })
        ));
        assert_eq!(pool.status().vacant, 1);

        factory.failing.store(false, Ordering::SeqCst);
        assert_eq!(pool.refill().await, 1);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn closed_pool_rejects_leases() {
        let pool = ConnectionPool::new(Arc::new(CountingFactory::new()), 1, LeasePolicy::Random);
        pool.close();

        assert!(matches!(pool.lease().await, Err(PoolError::Closed)));
    }
}
