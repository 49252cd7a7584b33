use super::PoolCounters;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit};
use tracing::debug;

/// Connection leased from a [`ConnectionPool`](super::ConnectionPool)
///
/// The connection is returned to its slot when the lease is dropped, unless it has been
/// [marked as broken](PooledConnection::mark_broken) in which case the slot is vacated.
pub struct PooledConnection<C> {
    slot: usize,
    connection: Option<C>,
    broken: bool,
    counters: Arc<PoolCounters>,
    // Field order matters: the slot has to be unlocked before the permit is released
    guard: OwnedMutexGuard<Option<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C> PooledConnection<C> {
    pub(super) fn new(
        slot: usize,
        connection: C,
        guard: OwnedMutexGuard<Option<C>>,
        permit: OwnedSemaphorePermit,
        counters: Arc<PoolCounters>,
    ) -> Self {
        Self {
            slot,
            connection: Some(connection),
            broken: false,
            counters,
            guard,
            _permit: permit,
        }
    }

    /// Index of the slot this connection occupies
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Discards the connection on release so that the slot reconnects on its next lease
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the connection will be discarded on release
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("pooled connection is present until released")
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("pooled connection is present until released")
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if self.broken {
            debug!(slot = self.slot, "Discarding broken pooled connection");
            self.counters.record_discard();
            *self.guard = None;
        } else {
            *self.guard = self.connection.take();
        }
    }
}
