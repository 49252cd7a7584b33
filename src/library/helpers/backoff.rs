//! Exponential backoff implementations

use std::{iter::Iterator, time::Duration};

/// Exponential backoff iterator
///
/// This struct implements the iterator trait and returns monotonically increasing values until a specified limit of
/// iterations is reached. Each element is the previous element multiplied by the `multiplier`, capped at `ceiling`.
#[derive(Debug, Clone)]
pub struct Backoff {
    retries: u32,
    limit: u32,
    multiplier: u32,
    initial: Duration,
    current: Duration,
    ceiling: Duration,
}

impl Backoff {
    /// Creates a new backoff starting at `initial` which yields at most `limit` values
    pub fn new(initial: Duration, limit: u32) -> Self {
        Self {
            retries: 0,
            limit,
            multiplier: 2,
            initial,
            current: initial,
            ceiling: Duration::from_secs(30),
        }
    }

    /// Caps every returned duration at the given value
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Starts over as if no value has been taken yet
    pub fn reset(&mut self) {
        self.retries = 0;
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(25), 13)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.retries += 1;

        if self.retries > self.limit {
            None
        } else {
            self.current = (self.current * self.multiplier).min(self.ceiling);
            Some(self.current)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonically_increasing() {
        let backoff = Backoff::default().with_ceiling(Duration::from_secs(3600));
        let mut previous = Duration::default();

        for duration in backoff {
            assert!(previous < duration);
            previous = duration;
        }
    }

    #[test]
    fn backoff_respects_ceiling_and_limit() {
        let backoff = Backoff::new(Duration::from_millis(100), 8).with_ceiling(Duration::from_secs(1));
        let values: Vec<Duration> = backoff.collect();

        assert_eq!(values.len(), 8);
        assert!(values.iter().all(|d| *d <= Duration::from_secs(1)));
        assert_eq!(values.last(), Some(&Duration::from_secs(1)));
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_millis(10), 2);
        let first = backoff.next();
        backoff.next();
        assert_eq!(backoff.next(), None);

        backoff.reset();
        assert_eq!(backoff.next(), first);
    }
}
