//! In-memory network for tests and demos.
//!
//! Every node has an advertised address and an external address. Reachable
//! nodes accept packets from anyone. NATed nodes sit behind a mapping that
//! rewrites their source port and only accepts packets from endpoints they
//! have sent to first (port-restricted cone). A node can also be given a
//! different mapped port towards one peer host (symmetric NAT), or filter by
//! host only (address-restricted cone). The network also hosts a shared
//! key-value store standing in for the DHT.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::contact::Contact;
use crate::dht::{Dht, DhtKey, DhtLookup, PutFlags};
use crate::error::TransportError;
use crate::transport::{HandlerKey, PunchTransport, TransferHandler, TransportEvent};

/// Simulated network connecting [`SimTransport`] nodes
pub struct SimNetwork {
    nodes: DashMap<SocketAddr, Arc<SimTransport>>,
    store: Mutex<HashMap<DhtKey, Vec<u8>>>,
    gets: AtomicU64,
}

impl SimNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            store: Mutex::new(HashMap::new()),
            gets: AtomicU64::new(0),
        })
    }

    /// Add a directly reachable node
    pub fn add_node(self: &Arc<Self>, address: SocketAddr) -> Arc<SimTransport> {
        self.insert(address, address, true)
    }

    /// Add a node behind NAT whose packets leave from `mapped_port`
    pub fn add_nat_node(self: &Arc<Self>, address: SocketAddr, mapped_port: u16) -> Arc<SimTransport> {
        self.insert(address, SocketAddr::new(address.ip(), mapped_port), false)
    }

    fn insert(self: &Arc<Self>, address: SocketAddr, external: SocketAddr, reachable: bool) -> Arc<SimTransport> {
        let (events, _) = broadcast::channel(16);
        let node = Arc::new(SimTransport {
            network: Arc::downgrade(self),
            local: Contact::from_address(address),
            external,
            reachable: AtomicBool::new(reachable),
            online: AtomicBool::new(true),
            address_restricted: AtomicBool::new(false),
            peer_ports: DashMap::new(),
            holes: Mutex::new(HashSet::new()),
            handlers: DashMap::new(),
            events,
        });
        self.nodes.insert(external, Arc::clone(&node));
        node
    }

    /// Make packets from `node` to host `peer` leave from `port`
    ///
    /// The new mapping routes back to `node` like its default one.
    pub fn map_port_for_peer(&self, node: &Arc<SimTransport>, peer: IpAddr, port: u16) {
        let mapped = SocketAddr::new(node.external.ip(), port);
        node.peer_ports.insert(peer, port);
        self.nodes.insert(mapped, Arc::clone(node));
    }

    /// DHT view of this network
    pub fn dht(self: &Arc<Self>) -> Arc<SimDht> {
        Arc::new(SimDht {
            network: Arc::downgrade(self),
        })
    }

    /// Raw value stored under `key`
    #[must_use]
    pub fn record(&self, key: &DhtKey) -> Option<Vec<u8>> {
        self.store.lock().get(key).cloned()
    }

    /// Number of DHT gets served
    #[must_use]
    pub fn dht_gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    fn route(&self, external: &SocketAddr) -> Option<Arc<SimTransport>> {
        self.nodes.get(external).map(|node| Arc::clone(node.value()))
    }

    fn reachable_nodes(&self) -> Vec<Arc<SimTransport>> {
        self.nodes
            .iter()
            .filter(|node| *node.key() == node.external)
            .filter(|node| node.is_online() && node.is_reachable())
            .map(|node| Arc::clone(node.value()))
            .collect()
    }
}

/// One simulated node's transport
pub struct SimTransport {
    network: Weak<SimNetwork>,
    local: Contact,
    external: SocketAddr,
    reachable: AtomicBool,
    online: AtomicBool,
    address_restricted: AtomicBool,
    peer_ports: DashMap<IpAddr, u16>,
    holes: Mutex<HashSet<SocketAddr>>,
    handlers: DashMap<HandlerKey, Arc<dyn TransferHandler>>,
    events: broadcast::Sender<TransportEvent>,
}

impl SimTransport {
    /// Address packets from this node appear to come from
    #[must_use]
    pub fn external_addr(&self) -> SocketAddr {
        self.external
    }

    /// Check whether the node currently exchanges packets
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Take the node off the network, or bring it back
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Change reachability and notify subscribers
    pub fn set_reachable(&self, reachable: bool) {
        if self.reachable.swap(reachable, Ordering::AcqRel) != reachable {
            // No subscribers is fine
            let _ = self.events.send(TransportEvent::ReachabilityChanged(reachable));
        }
    }

    /// Accept packets from any port of a host we have sent to
    pub fn set_address_restricted(&self, restricted: bool) {
        self.address_restricted.store(restricted, Ordering::Release);
    }

    fn accepts_from(&self, from: &SocketAddr) -> bool {
        if !self.is_online() {
            return false;
        }
        if self.is_reachable() {
            return true;
        }

        let holes = self.holes.lock();
        holes.contains(from)
            || (self.address_restricted.load(Ordering::Acquire)
                && holes.iter().any(|hole| hole.ip() == from.ip()))
    }

    /// Address our packets to `destination` appear to come from
    fn source_for(&self, destination: &SocketAddr) -> SocketAddr {
        match self.peer_ports.get(&destination.ip()) {
            Some(port) => SocketAddr::new(self.external.ip(), *port),
            None => self.external,
        }
    }

    /// Resolve the node behind `contact`, opening our mapping towards it
    ///
    /// Returns the peer and the source address it sees us at.
    fn connect(&self, contact: &Contact) -> Result<(Arc<SimTransport>, SocketAddr), TransportError> {
        if !self.is_online() {
            return Err(TransportError::Closed);
        }
        let network = self.network.upgrade().ok_or(TransportError::Closed)?;

        let destination = contact.transport_addr();
        self.holes.lock().insert(destination);

        let source = self.source_for(&destination);
        let peer = network
            .route(&destination)
            .ok_or(TransportError::Unreachable(destination))?;
        if !peer.accepts_from(&source) {
            return Err(TransportError::Unreachable(destination));
        }
        Ok((peer, source))
    }

    fn handler(&self, key: &HandlerKey, destination: SocketAddr) -> Result<Arc<dyn TransferHandler>, TransportError> {
        self.handlers
            .get(key)
            .map(|handler| Arc::clone(handler.value()))
            .ok_or(TransportError::NoReply(destination))
    }
}

#[async_trait]
impl PunchTransport for SimTransport {
    fn local_contact(&self) -> Contact {
        self.local.clone()
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    fn reachable_contacts(&self) -> Vec<Contact> {
        let Some(network) = self.network.upgrade() else {
            return Vec::new();
        };
        network
            .reachable_nodes()
            .into_iter()
            .filter(|node| node.external != self.external)
            .map(|node| node.local.clone())
            .collect()
    }

    async fn ping(&self, contact: &Contact) -> Result<(), TransportError> {
        self.connect(contact).map(|_| ())
    }

    async fn request(
        &self,
        contact: &Contact,
        key: &HandlerKey,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let (peer, source) = self.connect(contact)?;
        let handler = peer.handler(key, contact.transport_addr())?;
        let origin = self.local.observed_from(source.port());

        match tokio::time::timeout(timeout, handler.handle(origin, payload)).await {
            Ok(Some(reply)) if self.is_online() => Ok(reply),
            Ok(Some(_)) => Err(TransportError::Closed),
            Ok(None) => Err(TransportError::NoReply(contact.transport_addr())),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn send(
        &self,
        contact: &Contact,
        key: &HandlerKey,
        payload: Vec<u8>,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let (peer, source) = self.connect(contact)?;
        let handler = peer.handler(key, contact.transport_addr())?;
        let origin = self.local.observed_from(source.port());

        tokio::spawn(async move {
            handler.handle(origin, payload).await;
        });
        Ok(())
    }

    fn register_handler(&self, key: HandlerKey, handler: Arc<dyn TransferHandler>) {
        tracing::trace!("{} registered handler {}", self.external, handler.name());
        self.handlers.insert(key, handler);
    }

    fn unregister_handler(&self, key: &HandlerKey) {
        self.handlers.remove(key);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// DHT backed by the network's shared store
pub struct SimDht {
    network: Weak<SimNetwork>,
}

#[async_trait]
impl Dht for SimDht {
    async fn get(&self, key: &DhtKey, _max_values: usize, _timeout: Duration) -> DhtLookup {
        let Some(network) = self.network.upgrade() else {
            return DhtLookup {
                values: Vec::new(),
                timed_out: true,
            };
        };
        network.gets.fetch_add(1, Ordering::Relaxed);

        let value = network.store.lock().get(key).cloned();
        DhtLookup {
            timed_out: value.is_none(),
            values: value.into_iter().collect(),
        }
    }

    async fn put(&self, key: &DhtKey, value: Vec<u8>, _flags: PutFlags) -> Vec<Contact> {
        let Some(network) = self.network.upgrade() else {
            return Vec::new();
        };
        // Every slot holds one value
        network.store.lock().insert(*key, value);
        network
            .reachable_nodes()
            .into_iter()
            .map(|node| node.local.clone())
            .collect()
    }

    async fn remove(&self, key: &DhtKey) {
        if let Some(network) = self.network.upgrade() {
            network.store.lock().remove(key);
        }
    }

    async fn remove_from(&self, _targets: &[Contact], key: &DhtKey) {
        self.remove(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl TransferHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn handle(&self, originator: Contact, _payload: Vec<u8>) -> Option<Vec<u8>> {
            Some(originator.transport_addr().to_string().into_bytes())
        }
    }

    const KEY: HandlerKey = [7; 20];

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_nat_node_reachable_only_after_sending() {
        let network = SimNetwork::new();
        let open = network.add_node(addr("10.0.0.2:6881"));
        let natted = network.add_nat_node(addr("10.0.0.1:6881"), 40001);
        natted.register_handler(KEY, Arc::new(Echo));
        open.register_handler(KEY, Arc::new(Echo));

        let target = natted.local_contact().observed_from(40001);
        let timeout = Duration::from_millis(100);
        assert!(matches!(
            open.request(&target, &KEY, vec![], timeout).await,
            Err(TransportError::Unreachable(_))
        ));

        // The NATed node speaks first and is seen from its mapped port
        let reply = natted
            .request(&open.local_contact(), &KEY, vec![], timeout)
            .await
            .unwrap();
        assert_eq!(reply, b"10.0.0.1:40001");

        assert!(open.request(&target, &KEY, vec![], timeout).await.is_ok());
    }

    #[tokio::test]
    async fn test_per_peer_mapping_and_address_filter() {
        let network = SimNetwork::new();
        let open = network.add_node(addr("10.0.0.2:6881"));
        let symmetric = network.add_nat_node(addr("10.0.0.1:6881"), 40001);
        let cone = network.add_nat_node(addr("10.0.0.3:6881"), 40003);
        network.map_port_for_peer(&symmetric, IpAddr::from([10, 0, 0, 3]), 40011);
        for node in [&open, &symmetric, &cone] {
            node.register_handler(KEY, Arc::new(Echo));
        }
        let timeout = Duration::from_millis(100);

        // Other hosts still see the default mapping
        let reply = symmetric
            .request(&open.local_contact(), &KEY, vec![], timeout)
            .await
            .unwrap();
        assert_eq!(reply, b"10.0.0.1:40001");

        // The cone answers the symmetric side's default port, but later
        // packets to the cone leave from 40011
        let default_port = symmetric.local_contact().observed_from(40001);
        let cone_contact = cone.local_contact().observed_from(40003);
        assert!(symmetric.request(&cone_contact, &KEY, vec![], timeout).await.is_err());
        assert!(cone.send(&default_port, &KEY, vec![], timeout).await.is_ok());
        assert!(symmetric.request(&cone_contact, &KEY, vec![], timeout).await.is_err());

        cone.set_address_restricted(true);
        let reply = symmetric
            .request(&cone_contact, &KEY, vec![], timeout)
            .await
            .unwrap();
        assert_eq!(reply, b"10.0.0.1:40011");

        // Only default mappings count as nodes
        assert_eq!(cone.reachable_contacts(), vec![open.local_contact()]);
    }

    #[tokio::test]
    async fn test_ping_and_reachable_contacts() {
        let network = SimNetwork::new();
        let a = network.add_node(addr("10.0.0.2:6881"));
        let b = network.add_node(addr("10.0.0.3:6881"));
        let natted = network.add_nat_node(addr("10.0.0.1:6881"), 40001);

        assert_eq!(natted.reachable_contacts().len(), 2);
        assert_eq!(a.reachable_contacts(), vec![b.local_contact()]);
        assert!(natted.ping(&a.local_contact()).await.is_ok());
        assert!(a.ping(&natted.local_contact()).await.is_err());

        b.set_online(false);
        assert!(natted.ping(&b.local_contact()).await.is_err());
        assert_eq!(natted.reachable_contacts(), vec![a.local_contact()]);
    }

    #[tokio::test]
    async fn test_reachability_event() {
        let network = SimNetwork::new();
        let node = network.add_node(addr("10.0.0.2:6881"));
        let mut events = node.subscribe();

        node.set_reachable(false);
        node.set_reachable(false);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::ReachabilityChanged(false)
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dht_store() {
        let network = SimNetwork::new();
        network.add_node(addr("10.0.0.2:6881"));
        let dht = network.dht();
        let key = [1; 20];

        let write_set = dht.put(&key, vec![0, 1], PutFlags::SINGLE_VALUE).await;
        assert_eq!(write_set.len(), 1);
        assert_eq!(dht.get(&key, 1, Duration::from_secs(1)).await.values, vec![vec![0, 1]]);

        dht.remove_from(&write_set, &key).await;
        let lookup = dht.get(&key, 1, Duration::from_secs(1)).await;
        assert!(lookup.values.is_empty());
        assert!(lookup.timed_out);
        assert_eq!(network.dht_gets(), 2);
    }
}
