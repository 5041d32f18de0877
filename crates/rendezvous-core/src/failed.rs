//! Bounded history of rendezvous candidates that recently failed.

use std::collections::VecDeque;
use std::net::SocketAddr;

/// Fixed-capacity, least-recently-touched-first set of failed addresses
///
/// Recording an address that is already present moves it to the most recent
/// position. Once the capacity is exceeded the least recently touched address
/// is evicted. Lookups do not count as touches.
#[derive(Debug, Clone)]
pub struct FailedRendezvousCache {
    capacity: usize,
    // Front is the least recently touched
    entries: VecDeque<SocketAddr>,
}

impl FailedRendezvousCache {
    /// Create an empty cache holding at most `capacity` addresses
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1) + 1),
        }
    }

    /// Record a failed address
    pub fn record(&mut self, address: SocketAddr) {
        if let Some(pos) = self.entries.iter().position(|a| *a == address) {
            self.entries.remove(pos);
        }
        self.entries.push_back(address);

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Check whether an address recently failed
    #[must_use]
    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.entries.contains(address)
    }

    /// Number of remembered addresses
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of remembered addresses
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(i: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, (i >> 8) as u8, i as u8], 6881))
    }

    #[test]
    fn test_seventeen_inserts_keep_sixteen_most_recent() {
        let mut cache = FailedRendezvousCache::new(16);
        for i in 0..17 {
            cache.record(addr(i));
        }

        assert_eq!(cache.len(), 16);
        assert!(!cache.contains(&addr(0)));
        for i in 1..17 {
            assert!(cache.contains(&addr(i)));
        }
    }

    #[test]
    fn test_touch_protects_from_eviction() {
        let mut cache = FailedRendezvousCache::new(16);
        for i in 0..16 {
            cache.record(addr(i));
        }

        // Touch the oldest entry, then overflow
        cache.record(addr(0));
        cache.record(addr(100));

        assert_eq!(cache.len(), 16);
        assert!(cache.contains(&addr(0)));
        assert!(!cache.contains(&addr(1)));
        assert!(cache.contains(&addr(100)));
    }

    #[test]
    fn test_lookup_does_not_touch() {
        let mut cache = FailedRendezvousCache::new(2);
        cache.record(addr(1));
        cache.record(addr(2));
        assert!(cache.contains(&addr(1)));

        cache.record(addr(3));
        assert!(!cache.contains(&addr(1)));
        assert!(cache.contains(&addr(2)));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut cache = FailedRendezvousCache::new(0);
        cache.record(addr(1));
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(
            capacity in 1usize..32,
            inserts in proptest::collection::vec(0u16..64, 0..200),
        ) {
            let mut cache = FailedRendezvousCache::new(capacity);
            for i in &inserts {
                cache.record(addr(*i));
                prop_assert!(cache.len() <= capacity);
            }

            // The most recently recorded address is always present
            if let Some(last) = inserts.last() {
                prop_assert!(cache.contains(&addr(*last)));
            }
        }
    }
}
