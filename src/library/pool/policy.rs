use rand::Rng;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Strategy used to pick the slot a lease starts searching from
///
/// Leases are exclusive, if the preferred slot is in use the next free one is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePolicy {
    /// Rotates through all slots so traffic is spread evenly across connections
    RoundRobin,
    /// Always prefers the lowest free slot, keeping the remaining connections cold
    Sequential,
    /// Starts at a random slot
    Random,
}

impl LeasePolicy {
    pub(super) fn start(&self, cursor: &AtomicUsize, size: usize) -> usize {
        match self {
            LeasePolicy::RoundRobin => cursor.fetch_add(1, Ordering::Relaxed) % size,
            LeasePolicy::Sequential => 0,
            LeasePolicy::Random => rand::thread_rng().gen_range(0..size),
        }
    }
}

impl Default for LeasePolicy {
    fn default() -> Self {
        LeasePolicy::RoundRobin
    }
}

impl FromStr for LeasePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(LeasePolicy::RoundRobin),
            "sequential" => Ok(LeasePolicy::Sequential),
            "random" => Ok(LeasePolicy::Random),
            other => Err(format!("unknown lease policy '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_wraps_around() {
        let cursor = AtomicUsize::new(0);
        let starts: Vec<usize> = (0..5)
            .map(|_| LeasePolicy::RoundRobin.start(&cursor, 3))
            .collect();

        assert_eq!(starts, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn random_stays_in_bounds() {
        let cursor = AtomicUsize::new(0);
        assert!((0..100).all(|_| LeasePolicy::Random.start(&cursor, 4) < 4));
    }
}
