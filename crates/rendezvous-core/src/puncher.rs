//! The puncher facade and per-identity state.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::adapter::PunchAdapter;
use crate::config::PuncherConfig;
use crate::contact::Contact;
use crate::coordinator::OutstandingPunches;
use crate::dht::{Dht, DhtKey};
use crate::error::{FailureKind, PunchError, Result};
use crate::failed::FailedRendezvousCache;
use crate::listener::{ListenerId, ListenerRegistry, RendezvousListener};
use crate::lookup::RendezvousLookupCache;
use crate::maintainer::{FailoverReason, RebindState, RendezvousPhase};
use crate::message::{ClientData, MessageKind, PunchMessage};
use crate::registry::IdentityRegistry;
use crate::server::BindingTable;
use crate::stats::{PunchCounters, StatsSnapshot};
use crate::sync::StateLock;
use crate::timer::TimerGroup;
use crate::transport::{HANDLER_KEY, PunchTransport, TransferHandler};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Role of an identity sharing the node's transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the transport handler and serves as rendezvous for others
    Primary,
    /// Seeks its own rendezvous but never serves
    Secondary,
}

impl Role {
    /// Check for the primary role
    #[must_use]
    pub fn is_primary(self) -> bool {
        self == Self::Primary
    }

    /// Check for the secondary role
    #[must_use]
    pub fn is_secondary(self) -> bool {
        self == Self::Secondary
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        })
    }
}

/// Our record in the DHT and the nodes that stored it
#[derive(Debug, Clone)]
pub(crate) struct PublishRecord {
    pub(crate) key: DhtKey,
    pub(crate) write_set: Vec<Contact>,
}

/// Publish and rendezvous state (one guarded section)
pub(crate) struct RendezvousState {
    pub(crate) local: Option<Contact>,
    pub(crate) target: Option<Contact>,
    pub(crate) last_ok: Option<Contact>,
    pub(crate) failed: FailedRendezvousCache,
    pub(crate) explicit: HashMap<SocketAddr, Contact>,
    pub(crate) publishing: bool,
    pub(crate) last_publish: Option<Instant>,
    pub(crate) maintainer_running: bool,
    pub(crate) record: Option<PublishRecord>,
    pub(crate) phase: RendezvousPhase,
}

impl RendezvousState {
    fn new(failed_history: usize) -> Self {
        Self {
            local: None,
            target: None,
            last_ok: None,
            failed: FailedRendezvousCache::new(failed_history),
            explicit: HashMap::new(),
            publishing: false,
            last_publish: None,
            maintainer_running: false,
            record: None,
            phase: RendezvousPhase::Idle,
        }
    }

    fn operational_rendezvous(&self) -> Option<Contact> {
        match (&self.last_ok, &self.target) {
            (Some(ok), Some(target)) if ok == target => Some(target.clone()),
            _ => None,
        }
    }
}

/// Shared resources of one node, handed to every identity
struct NodeShared {
    config: PuncherConfig,
    transport: Arc<dyn PunchTransport>,
    dht: Arc<dyn Dht>,
    adapter: Arc<dyn PunchAdapter>,
    lookups: Arc<RendezvousLookupCache>,
    registry: Arc<IdentityRegistry<PuncherInner>>,
    probe_inbound: TimerGroup,
    probe_outbound: TimerGroup,
}

/// One identity; background tasks hold it weakly
pub(crate) struct PuncherInner {
    pub(crate) role: Role,
    pub(crate) serial: u64,
    pub(crate) self_ref: Weak<PuncherInner>,
    pub(crate) config: PuncherConfig,
    pub(crate) transport: Arc<dyn PunchTransport>,
    pub(crate) dht: Arc<dyn Dht>,
    pub(crate) adapter: Arc<dyn PunchAdapter>,
    pub(crate) lookups: Arc<RendezvousLookupCache>,
    pub(crate) registry: Arc<IdentityRegistry<PuncherInner>>,
    pub(crate) probe_inbound: TimerGroup,
    pub(crate) probe_outbound: TimerGroup,

    started: AtomicBool,
    suspended: AtomicBool,
    pub(crate) force_active: AtomicBool,
    destroyed: AtomicBool,

    pub(crate) state: StateLock<RendezvousState>,
    pub(crate) bindings: StateLock<BindingTable>,
    pub(crate) punches: StateLock<OutstandingPunches>,
    pub(crate) rebind: StateLock<RebindState>,
    pub(crate) secondaries: StateLock<Vec<Arc<PuncherInner>>>,
    pub(crate) tasks: StateLock<Vec<JoinHandle<()>>>,

    pub(crate) counters: PunchCounters,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) rebind_wake: Arc<Notify>,
}

impl PuncherInner {
    fn new(role: Role, shared: NodeShared) -> Arc<Self> {
        let config = shared.config;
        Arc::new_cyclic(|self_ref| Self {
            role,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            self_ref: Weak::clone(self_ref),
            transport: shared.transport,
            dht: shared.dht,
            adapter: shared.adapter,
            lookups: shared.lookups,
            registry: shared.registry,
            probe_inbound: shared.probe_inbound,
            probe_outbound: shared.probe_outbound,
            started: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            force_active: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            state: StateLock::new("rendezvous", RendezvousState::new(config.failed_history)),
            bindings: StateLock::new("bindings", BindingTable::new(&config)),
            punches: StateLock::new(
                "punches",
                OutstandingPunches::new(config.max_outstanding_punches),
            ),
            rebind: StateLock::new(
                "rebind",
                RebindState::new(config.rebind_fail_limit, config.initial_fail_budget),
            ),
            secondaries: StateLock::new("secondaries", Vec::new()),
            tasks: StateLock::new("tasks", Vec::new()),
            counters: PunchCounters::new(),
            listeners: ListenerRegistry::new(),
            rebind_wake: Arc::new(Notify::new()),
            config,
        })
    }

    fn shared(&self) -> NodeShared {
        NodeShared {
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            dht: Arc::clone(&self.dht),
            adapter: Arc::clone(&self.adapter),
            lookups: Arc::clone(&self.lookups),
            registry: Arc::clone(&self.registry),
            probe_inbound: self.probe_inbound.clone(),
            probe_outbound: self.probe_outbound.clone(),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn start_identity(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut tasks = vec![self.spawn_event_watcher(), self.spawn_republisher()];
        tasks.extend(self.listeners.spawn_dispatcher());
        if self.role.is_primary() {
            let handler = InboundHandler {
                primary: Weak::clone(&self.self_ref),
            };
            self.transport.register_handler(*HANDLER_KEY, Arc::new(handler));
            tasks.push(self.spawn_sweeper());
        }
        self.tasks.lock().extend(tasks);

        tracing::info!(role = %self.role, "Puncher started as {}", self.transport.local_contact());
        self.publish(false);
    }

    fn spawn_event_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.transport.subscribe();
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => Some(event),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::trace!("Missed {} transport events", missed);
                        None
                    }
                    Err(RecvError::Closed) => break,
                };

                let Some(this) = weak.upgrade() else { break };
                if let Some(event) = event {
                    tracing::debug!(role = %this.role, "Transport event: {:?}", event);
                }
                this.publish(true);
            }
        })
    }

    fn spawn_republisher(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.republish_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.publish(false);
            }
        })
    }

    fn apply_suspended(self: &Arc<Self>, suspended: bool) {
        let was = self.suspended.swap(suspended, Ordering::AcqRel);
        if was == suspended {
            return;
        }
        tracing::debug!(role = %self.role, "Suspended: {}", suspended);

        if suspended || !self.is_started() || self.is_destroyed() {
            return;
        }

        // Bindings may have lapsed while we slept: give the rendezvous a grace
        // period to prove itself, then drop it if nothing moved
        let seen = { self.state.lock().target.clone() };
        let weak = Arc::downgrade(self);
        let grace = self.config.resume_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(this) = weak.upgrade() else { return };
            if this.is_suspended() {
                return;
            }

            let current = { this.state.lock().target.clone() };
            match (seen, current) {
                (Some(seen), Some(current)) if seen == current => {
                    this.rendezvous_failed(&current, FailoverReason::Stale);
                }
                _ => this.publish(false),
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop one identity; the caller handles secondaries
    async fn shutdown(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let tasks: Vec<_> = { self.tasks.lock().drain(..).collect() };
        for task in tasks {
            task.abort();
        }

        if self.role.is_primary() {
            self.transport.unregister_handler(&HANDLER_KEY);
        }

        let bound = { self.bindings.lock().drain() };
        for contact in bound {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let closed = this
                    .send_request(&contact, PunchMessage::CloseRequest, this.config.transfer_timeout)
                    .await;
                if let Err(e) = closed {
                    tracing::trace!("Close to {} failed: {}", contact, e);
                }
            });
        }

        let record = { self.state.lock().record.take() };
        if let Some(record) = record {
            self.dht.remove_from(&record.write_set, &record.key).await;
        }

        self.registry.forget(self.serial);
        tracing::info!(role = %self.role, "Puncher destroyed");
    }

    fn owner_for(self: &Arc<Self>, originator: &Contact) -> Arc<Self> {
        self.registry
            .owner(&originator.address())
            .filter(|owner| !owner.is_destroyed())
            .unwrap_or_else(|| Arc::clone(self))
    }

    fn identities(self: &Arc<Self>) -> Vec<Arc<Self>> {
        let secondaries = { self.secondaries.lock().clone() };
        let mut all = Vec::with_capacity(secondaries.len() + 1);
        all.push(Arc::clone(self));
        all.extend(secondaries);
        all
    }

    /// Dispatch one inbound message; `None` means no reply
    async fn handle_message(
        self: &Arc<Self>,
        originator: Contact,
        message: PunchMessage,
    ) -> Option<PunchMessage> {
        self.counters.record_message(message.kind());

        match message {
            PunchMessage::BindRequest => Some(self.receive_bind(&originator)),
            PunchMessage::PunchRequest {
                target,
                client_data,
                message_only,
            } => Some(
                self.receive_punch(&originator, target, client_data, message_only)
                    .await,
            ),
            PunchMessage::ConnectRequest {
                origin,
                port,
                client_data,
                message_only,
            } => Some(
                self.receive_connect(&originator, &origin, port, client_data, message_only)
                    .await,
            ),
            PunchMessage::TunnelInbound => {
                self.receive_tunnel(&originator);
                None
            }
            PunchMessage::TunnelOutbound => {
                tracing::trace!("Tunnel probe from {}", originator);
                None
            }
            PunchMessage::QueryRequest => Some(self.receive_query(&originator)),
            PunchMessage::CloseRequest => Some(self.receive_close(&originator)),
            reply => {
                tracing::debug!("Unsolicited {} from {}", reply.kind(), originator);
                self.counters.record_failure(FailureKind::Decode);
                None
            }
        }
    }

    pub(crate) async fn punch(
        self: &Arc<Self>,
        reason: &str,
        target: &Contact,
        rendezvous: &mut Option<Contact>,
        client_data: Option<ClientData>,
        message_only: bool,
    ) -> Option<ClientData> {
        let via = match rendezvous.clone() {
            Some(via) => Some(via),
            None => self.rendezvous_for(target).await,
        };
        let Some(via) = via else {
            tracing::debug!(reason, "No rendezvous known for {}", target);
            if !message_only {
                self.counters.record_punch_sent(false);
            }
            return None;
        };
        *rendezvous = Some(via.clone());

        let result = self
            .send_punch(&via, target, client_data, message_only)
            .await;
        if !message_only {
            self.counters.record_punch_sent(result.is_ok());
        }

        match result {
            Ok(reply) => {
                tracing::debug!(reason, "Punch to {} via {} succeeded", target, via);
                Some(reply)
            }
            Err(e) => {
                tracing::debug!(reason, "Punch to {} via {} failed: {}", target, via, e);
                self.counters.record_failure(e.kind());
                None
            }
        }
    }

    async fn rendezvous_for(&self, target: &Contact) -> Option<Contact> {
        let explicit = { self.state.lock().explicit.get(&target.address()).cloned() };
        if explicit.is_some() {
            return explicit;
        }

        match self.lookups.resolve(target).await {
            Ok(rendezvous) => Some(rendezvous),
            Err(e) => {
                self.counters.record_failure(e.kind());
                None
            }
        }
    }
}

/// The single transport handler, registered by the primary
struct InboundHandler {
    primary: Weak<PuncherInner>,
}

#[async_trait]
impl TransferHandler for InboundHandler {
    fn name(&self) -> &str {
        "rendezvous puncher"
    }

    async fn handle(&self, originator: Contact, payload: Vec<u8>) -> Option<Vec<u8>> {
        let primary = self.primary.upgrade()?;

        let message = match PunchMessage::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Undecodable request from {}: {}", originator, e);
                primary.counters.record_failure(e.kind());
                return None;
            }
        };

        let reply = match message.kind() {
            // Sent by an identity's rendezvous: route to that identity
            MessageKind::ConnectRequest | MessageKind::CloseRequest => {
                primary
                    .owner_for(&originator)
                    .handle_message(originator, message)
                    .await
            }
            // Any identity may be waiting on this probe; count it once
            MessageKind::TunnelInbound => {
                primary.counters.record_message(MessageKind::TunnelInbound);
                for identity in primary.identities() {
                    identity.receive_tunnel(&originator);
                }
                None
            }
            _ => primary.handle_message(originator, message).await,
        }?;

        match reply.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::debug!("Failed to encode {}: {}", reply.kind(), e);
                None
            }
        }
    }
}

/// NAT-traversal puncher for one node
///
/// The value returned by [`Puncher::new`] is the primary identity. It serves as
/// rendezvous for other peers and owns the transport handler. Further
/// identities sharing the transport come from [`Puncher::spawn_secondary`].
///
/// Network failures never surface as errors: operations return `None` and
/// bump a counter in [`Puncher::stats`].
#[derive(Clone)]
pub struct Puncher {
    pub(crate) inner: Arc<PuncherInner>,
}

impl Puncher {
    /// Create the primary identity
    ///
    /// # Errors
    ///
    /// Returns [`PunchError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        config: PuncherConfig,
        transport: Arc<dyn PunchTransport>,
        dht: Arc<dyn Dht>,
        adapter: Arc<dyn PunchAdapter>,
    ) -> Result<Self> {
        config.validate()?;

        let lookups = Arc::new(RendezvousLookupCache::new(
            Arc::clone(&dht),
            Arc::clone(&transport),
            config.lookup_ttl,
            config.lookup_timeout,
        ));
        let shared = NodeShared {
            probe_inbound: TimerGroup::new("tunnel-inbound", config.timer_workers),
            probe_outbound: TimerGroup::new("tunnel-outbound", config.timer_workers),
            config,
            transport,
            dht,
            adapter,
            lookups,
            registry: Arc::new(IdentityRegistry::new()),
        };

        Ok(Self {
            inner: PuncherInner::new(Role::Primary, shared),
        })
    }

    /// Start publishing and, for the primary, serving
    ///
    /// Must be called from within a tokio runtime. Starts any secondaries
    /// spawned before this call.
    pub fn start(&self) {
        for identity in self.inner.identities() {
            identity.start_identity();
        }
    }

    /// Create a secondary identity sharing this node's transport
    ///
    /// # Errors
    ///
    /// Returns [`PunchError::Misuse`] when called on a secondary.
    pub fn spawn_secondary(&self) -> Result<Self> {
        if self.inner.role.is_secondary() {
            return Err(PunchError::misuse(
                "secondary identities cannot spawn further identities",
            ));
        }

        let inner = PuncherInner::new(Role::Secondary, self.inner.shared());
        inner
            .suspended
            .store(self.inner.is_suspended(), Ordering::Release);
        inner.force_active.store(
            self.inner.force_active.load(Ordering::Acquire),
            Ordering::Release,
        );
        self.inner.secondaries.lock().push(Arc::clone(&inner));

        if self.inner.is_started() {
            inner.start_identity();
        }
        Ok(Self { inner })
    }

    /// Pause or resume re-binding, for this identity and its secondaries
    ///
    /// On resume the current rendezvous is given a grace period; if it is
    /// still the same afterwards it is treated as failed and replaced.
    pub fn set_suspended(&self, suspended: bool) {
        for identity in self.inner.identities() {
            identity.apply_suspended(suspended);
        }
    }

    /// Seek a rendezvous even when directly reachable
    pub fn force_active(&self, force: bool) {
        for identity in self.inner.identities() {
            identity.force_active.store(force, Ordering::Release);
            if identity.is_started() {
                identity.publish(true);
            }
        }
    }

    /// Tear down this identity and its secondaries
    ///
    /// Bound peers get a best-effort CLOSE and our DHT record is removed.
    pub async fn destroy(&self) {
        let identities = self.inner.identities();
        for identity in identities.iter().rev() {
            identity.shutdown().await;
        }
        self.inner.secondaries.lock().clear();
    }

    /// Punch through to `target`
    ///
    /// `rendezvous` names the relay to use; when `None` it is resolved through
    /// the explicit overrides and then the DHT, and written back. Returns the
    /// target's reply payload, or `None` if the punch failed.
    pub async fn punch(
        &self,
        reason: &str,
        target: &Contact,
        rendezvous: &mut Option<Contact>,
        client_data: Option<ClientData>,
    ) -> Option<ClientData> {
        self.inner
            .punch(reason, target, rendezvous, client_data, false)
            .await
    }

    /// Punch to a bare address, writing the corrected transport address back
    pub async fn punch_address(
        &self,
        reason: &str,
        target: &mut SocketAddr,
        client_data: Option<ClientData>,
    ) -> Option<ClientData> {
        let contact = self.inner.transport.contact_for_address(*target);
        let reply = self
            .inner
            .punch(reason, &contact, &mut None, client_data, false)
            .await;
        *target = contact.transport_addr();
        reply
    }

    /// Relay a payload to `target` through `rendezvous` without opening a tunnel
    pub async fn send_message(
        &self,
        rendezvous: SocketAddr,
        target: SocketAddr,
        client_data: ClientData,
    ) -> Option<ClientData> {
        let rendezvous = self.inner.transport.contact_for_address(rendezvous);
        let target = self.inner.transport.contact_for_address(target);
        self.inner
            .punch("message", &target, &mut Some(rendezvous), Some(client_data), true)
            .await
    }

    /// Force `rendezvous` to be used for `target`
    ///
    /// When `target` is this node, a publish pass runs at once.
    pub fn set_rendezvous(&self, target: &Contact, rendezvous: Contact) {
        let local = self.inner.transport.local_contact();
        {
            self.inner
                .state
                .lock()
                .explicit
                .insert(target.address(), rendezvous);
        }
        if target.address() == local.address() && self.inner.is_started() {
            self.inner.publish(true);
        }
    }

    /// Ask `contact` how it sees our external address
    pub async fn query(&self, contact: &Contact) -> Option<SocketAddr> {
        let reply = self
            .inner
            .send_request(contact, PunchMessage::QueryRequest, self.inner.config.transfer_timeout)
            .await;

        match reply {
            Ok(PunchMessage::QueryReply {
                ok: true,
                ip: Some(ip),
                port: Some(port),
            }) => Some(SocketAddr::new(ip, port)),
            Ok(_) => {
                self.inner.counters.record_failure(FailureKind::Denied);
                None
            }
            Err(e) => {
                self.inner.counters.record_failure(e.kind());
                None
            }
        }
    }

    /// Current rendezvous, once it has accepted a bind
    #[must_use]
    pub fn rendezvous(&self) -> Option<Contact> {
        self.inner.state.lock().operational_rendezvous()
    }

    /// Check whether a rendezvous has accepted our bind
    #[must_use]
    pub fn operational(&self) -> bool {
        self.rendezvous().is_some()
    }

    /// Check whether a rendezvous has been chosen
    #[must_use]
    pub fn active(&self) -> bool {
        self.inner.state.lock().local.is_some()
    }

    /// Local contact published alongside the current rendezvous
    ///
    /// `None` while the identity is not seeking a rendezvous.
    #[must_use]
    pub fn local_contact(&self) -> Option<Contact> {
        self.inner.state.lock().local.clone()
    }

    /// Current rendezvous phase
    #[must_use]
    pub fn phase(&self) -> RendezvousPhase {
        self.inner.state.lock().phase
    }

    /// Role of this identity
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Register for rendezvous changes
    ///
    /// If a rendezvous is already operational the listener is told at once.
    pub fn add_listener(&self, listener: impl RendezvousListener) -> ListenerId {
        let listener: Arc<dyn RendezvousListener> = Arc::new(listener);
        let current = self.rendezvous();
        let id = self.inner.listeners.add(Arc::clone(&listener));
        if let Some(rendezvous) = current {
            listener.rendezvous_changed(&rendezvous);
        }
        id
    }

    /// Unregister a listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Counters and state for diagnostics
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let now = Instant::now();
        let mut snapshot = StatsSnapshot::default();

        {
            let state = self.inner.state.lock();
            snapshot.phase = state.phase;
            snapshot.rendezvous = state.target.as_ref().map(|t| t.address().ip());
        }
        {
            let rebind = self.inner.rebind.lock();
            let age = |at: Option<Instant>| at.map(|at| now.saturating_duration_since(at));
            snapshot.fail_count = rebind.tracker.fail_count();
            snapshot.last_ok_age = age(rebind.tracker.last_ok());
            snapshot.last_fail_age = age(rebind.tracker.last_fail());
        }
        snapshot.bindings = { self.inner.bindings.lock().summaries(now) };
        self.inner.counters.fill(&mut snapshot);

        snapshot
    }
}

impl fmt::Debug for Puncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Puncher")
            .field("role", &self.inner.role)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}
