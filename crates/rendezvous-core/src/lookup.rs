//! Single-flight, TTL-memoized lookups of a target's rendezvous.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::contact::Contact;
use crate::dht::{Dht, decode_record, publish_key};
use crate::error::{PunchError, Result};
use crate::sync::StateLock;
use crate::transport::PunchTransport;

type LookupOutcome = Result<Contact>;

struct LookupEntry {
    // None while the lookup is in flight
    fetched_at: Option<Instant>,
    outcome: watch::Receiver<Option<LookupOutcome>>,
}

impl LookupEntry {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        self.fetched_at
            .is_none_or(|at| now.saturating_duration_since(at) <= ttl)
    }
}

struct LookupTable {
    entries: HashMap<SocketAddr, LookupEntry>,
    last_tidy: Instant,
}

impl LookupTable {
    /// Drop completed entries older than `ttl`, at most once per `ttl`
    fn tidy(&mut self, now: Instant, ttl: Duration) {
        if now.saturating_duration_since(self.last_tidy) < ttl {
            return;
        }
        self.last_tidy = now;
        self.entries.retain(|_, entry| entry.is_fresh(now, ttl));
    }
}

/// Resolves "who is X's rendezvous" through the DHT
///
/// Concurrent callers for the same target share one DHT `get`; completed
/// results (including "not found") are reused until they expire.
pub struct RendezvousLookupCache {
    ttl: Duration,
    timeout: Duration,
    dht: Arc<dyn Dht>,
    transport: Arc<dyn PunchTransport>,
    table: Arc<StateLock<LookupTable>>,
}

impl RendezvousLookupCache {
    /// Create a cache
    #[must_use]
    pub fn new(
        dht: Arc<dyn Dht>,
        transport: Arc<dyn PunchTransport>,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            ttl,
            timeout,
            dht,
            transport,
            table: Arc::new(StateLock::new(
                "lookups",
                LookupTable {
                    entries: HashMap::new(),
                    last_tidy: Instant::now(),
                },
            )),
        }
    }

    /// Resolve the rendezvous published by `target`
    ///
    /// # Errors
    ///
    /// Returns [`PunchError::NoRendezvous`] if nothing is published or the
    /// lookup times out, and a decode error if the record is malformed.
    pub async fn resolve(&self, target: &Contact) -> Result<Contact> {
        let key = target.address();
        let now = Instant::now();

        let (mut outcome, leader) = {
            let mut table = self.table.lock();
            table.tidy(now, self.ttl);

            match table.entries.get(&key) {
                Some(entry) if entry.is_fresh(now, self.ttl) => (entry.outcome.clone(), None),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    table.entries.insert(
                        key,
                        LookupEntry {
                            fetched_at: None,
                            outcome: rx.clone(),
                        },
                    );
                    (rx, Some(tx))
                }
            }
        };

        if let Some(tx) = leader {
            // Runs detached so an abandoned caller cannot strand the others
            let dht = self.dht.clone();
            let transport = self.transport.clone();
            let table = self.table.clone();
            let timeout = self.timeout;
            let target = target.clone();

            tokio::spawn(async move {
                let result = fetch(dht.as_ref(), transport.as_ref(), &target, timeout).await;
                {
                    let mut table = table.lock();
                    if let Some(entry) = table.entries.get_mut(&key) {
                        entry.fetched_at = Some(Instant::now());
                    }
                }
                tx.send_replace(Some(result));
            });
        }

        let resolved = match outcome.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        resolved.unwrap_or(Err(PunchError::NoRendezvous(key)))
    }

    /// Number of cached entries, in flight or completed
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn fetch(
    dht: &dyn Dht,
    transport: &dyn PunchTransport,
    target: &Contact,
    timeout: Duration,
) -> LookupOutcome {
    let lookup = dht.get(&publish_key(target), 1, timeout).await;

    let result = match lookup.values.first() {
        Some(value) => decode_record(transport, value),
        None => Err(PunchError::NoRendezvous(target.address())),
    };

    match &result {
        Ok(rendezvous) => tracing::debug!("Lookup of rendezvous for {} -> {}", target, rendezvous),
        Err(PunchError::NoRendezvous(_)) => tracing::trace!(
            "Lookup of rendezvous for {} found nothing (timed out: {})",
            target,
            lookup.timed_out
        ),
        Err(e) => tracing::debug!("Lookup of rendezvous for {} failed: {}", target, e),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::Contact;
    use crate::dht::{DhtKey, DhtLookup, PutFlags, encode_record};
    use crate::sim::SimNetwork;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// DHT holding at most one value, answering after a delay
    struct SlowDht {
        value: parking_lot::Mutex<Option<(DhtKey, Vec<u8>)>>,
        gets: AtomicUsize,
        delay: Duration,
    }

    impl SlowDht {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                value: parking_lot::Mutex::new(None),
                gets: AtomicUsize::new(0),
                delay,
            })
        }

        fn gets(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Dht for SlowDht {
        async fn get(&self, key: &DhtKey, _max: usize, _timeout: Duration) -> DhtLookup {
            self.gets.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let value = self.value.lock().clone();
            match value {
                Some((k, v)) if k == *key => DhtLookup {
                    values: vec![v],
                    timed_out: false,
                },
                _ => DhtLookup {
                    values: vec![],
                    timed_out: true,
                },
            }
        }

        async fn put(&self, key: &DhtKey, value: Vec<u8>, _flags: PutFlags) -> Vec<Contact> {
            *self.value.lock() = Some((*key, value));
            vec![]
        }

        async fn remove(&self, _key: &DhtKey) {
            *self.value.lock() = None;
        }

        async fn remove_from(&self, _targets: &[Contact], _key: &DhtKey) {
            *self.value.lock() = None;
        }
    }

    fn setup(delay: Duration) -> (Arc<SlowDht>, RendezvousLookupCache, Contact, Contact) {
        let network = SimNetwork::new();
        let transport = network.add_node("10.0.0.3:6881".parse().unwrap());
        let dht = SlowDht::new(delay);
        let cache = RendezvousLookupCache::new(
            dht.clone(),
            transport,
            Duration::from_secs(120),
            Duration::from_secs(30),
        );
        let target = Contact::from_address("10.0.0.1:6881".parse().unwrap());
        let rendezvous = Contact::from_address("10.0.0.2:6881".parse().unwrap());
        (dht, cache, target, rendezvous)
    }

    async fn publish(dht: &SlowDht, target: &Contact, rendezvous: &Contact) {
        let network = SimNetwork::new();
        let transport = network.add_node("10.0.0.9:6881".parse().unwrap());
        let value = encode_record(transport.as_ref(), rendezvous).unwrap();
        dht.put(&publish_key(target), value, PutFlags::SINGLE_VALUE)
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_lookups_share_one_get() {
        let (dht, cache, target, rendezvous) = setup(Duration::from_millis(50));
        publish(&dht, &target, &rendezvous).await;

        let (a, b) = tokio::join!(cache.resolve(&target), cache.resolve(&target));
        assert_eq!(dht.gets(), 1);
        assert_eq!(a.unwrap(), rendezvous);
        assert_eq!(b.unwrap(), rendezvous);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_lookups_share_not_found() {
        let (dht, cache, target, _) = setup(Duration::from_millis(50));

        let (a, b) = tokio::join!(cache.resolve(&target), cache.resolve(&target));
        assert_eq!(dht.gets(), 1);
        assert!(matches!(a, Err(PunchError::NoRendezvous(_))));
        assert!(matches!(b, Err(PunchError::NoRendezvous(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_cached_until_ttl() {
        let (dht, cache, target, rendezvous) = setup(Duration::from_millis(10));
        publish(&dht, &target, &rendezvous).await;

        cache.resolve(&target).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        cache.resolve(&target).await.unwrap();
        assert_eq!(dht.gets(), 1);

        tokio::time::advance(Duration::from_secs(121)).await;
        cache.resolve(&target).await.unwrap();
        assert_eq!(dht.gets(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_swept_lazily() {
        let (dht, cache, target, _) = setup(Duration::from_millis(10));
        let other = Contact::from_address("10.0.0.7:6881".parse().unwrap());

        let _ = cache.resolve(&target).await;
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(200)).await;
        let _ = cache.resolve(&other).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(dht.gets(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_version_is_not_found() {
        let (dht, cache, target, rendezvous) = setup(Duration::from_millis(10));
        publish(&dht, &target, &rendezvous).await;
        if let Some((_, value)) = dht.value.lock().as_mut() {
            value[0] = 9;
        }

        let err = cache.resolve(&target).await.unwrap_err();
        assert!(matches!(err, PunchError::UnsupportedVersion(9)));
    }
}
