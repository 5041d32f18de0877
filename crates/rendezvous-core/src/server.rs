//! Rendezvous server side: the table of peers bound to this node.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PuncherConfig;
use crate::contact::Contact;
use crate::error::{FailureKind, PunchError, Result};
use crate::maintainer::FailoverReason;
use crate::message::PunchMessage;
use crate::puncher::PuncherInner;

/// A peer that uses this node as its rendezvous
#[derive(Debug, Clone)]
pub struct Binding {
    contact: Contact,
    bind_time: Instant,
    ok_count: u32,
    consec_fails: u32,
    last_connect: Option<Instant>,
}

impl Binding {
    fn new(contact: Contact, now: Instant) -> Self {
        Self {
            contact,
            bind_time: now,
            ok_count: 0,
            consec_fails: 0,
            last_connect: None,
        }
    }

    /// Bound peer as last observed
    #[must_use]
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    /// Successful connects brokered to this peer
    #[must_use]
    pub fn ok_count(&self) -> u32 {
        self.ok_count
    }

    /// Consecutive failed connects
    #[must_use]
    pub fn consec_fails(&self) -> u32 {
        self.consec_fails
    }

    /// Time since the last bind or re-bind
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.bind_time)
    }

    /// Check whether connects may be forwarded to this peer
    ///
    /// A peer is quarantined once it has `fail_limit` consecutive failures,
    /// until `cooldown` has passed since the most recent one.
    #[must_use]
    pub fn is_ok_to_connect(&self, now: Instant, fail_limit: u32, cooldown: Duration) -> bool {
        if self.consec_fails < fail_limit {
            return true;
        }
        self.last_connect
            .is_none_or(|last| now.saturating_duration_since(last) > cooldown)
    }

    fn rebind(&mut self, contact: Contact, now: Instant) {
        // Newest observation carries the freshest NAT port
        self.contact = contact;
        self.bind_time = now;
    }

    fn connect_ok(&mut self, now: Instant) {
        self.ok_count += 1;
        self.consec_fails = 0;
        self.last_connect = Some(now);
    }

    fn connect_failed(&mut self, now: Instant) {
        self.consec_fails += 1;
        self.last_connect = Some(now);
    }
}

/// How an accepted bind was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindDisposition {
    /// A new binding was created
    Created,
    /// An existing binding was refreshed
    Refreshed,
}

/// Peers bound to this node, keyed by advertised address
#[derive(Debug)]
pub struct BindingTable {
    capacity: usize,
    timeout: Duration,
    connect_fail_limit: u32,
    connect_cooldown: Duration,
    entries: HashMap<SocketAddr, Binding>,
}

impl BindingTable {
    /// Create a table using the limits in `config`
    #[must_use]
    pub fn new(config: &PuncherConfig) -> Self {
        Self::with_limits(
            config.max_bindings,
            config.binding_timeout,
            config.connect_fail_limit,
            config.connect_retry_cooldown,
        )
    }

    /// Create a table with explicit limits
    #[must_use]
    pub fn with_limits(
        capacity: usize,
        timeout: Duration,
        connect_fail_limit: u32,
        connect_cooldown: Duration,
    ) -> Self {
        Self {
            capacity,
            timeout,
            connect_fail_limit,
            connect_cooldown,
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Accept or refresh a binding for `contact`
    ///
    /// # Errors
    ///
    /// Returns [`PunchError::Capacity`] if the table is full and `contact` is not
    /// already bound, or [`PunchError::Quarantined`] if its binding is failing.
    pub fn bind(&mut self, contact: Contact, now: Instant) -> Result<BindDisposition> {
        let key = contact.address();

        if let Some(binding) = self.entries.get_mut(&key) {
            if !binding.is_ok_to_connect(now, self.connect_fail_limit, self.connect_cooldown) {
                return Err(PunchError::Quarantined(key));
            }
            binding.rebind(contact, now);
            return Ok(BindDisposition::Refreshed);
        }

        if self.entries.len() >= self.capacity {
            return Err(PunchError::capacity("binding table full"));
        }

        self.entries.insert(key, Binding::new(contact, now));
        Ok(BindDisposition::Created)
    }

    /// Contact to forward a connect for `target` to
    ///
    /// # Errors
    ///
    /// Returns [`PunchError::UnknownBinding`] if `target` is not bound, or
    /// [`PunchError::Quarantined`] if its binding is failing.
    pub fn connect_target(&self, target: &SocketAddr, now: Instant) -> Result<Contact> {
        let binding = self
            .entries
            .get(target)
            .ok_or(PunchError::UnknownBinding(*target))?;

        if !binding.is_ok_to_connect(now, self.connect_fail_limit, self.connect_cooldown) {
            return Err(PunchError::Quarantined(*target));
        }

        Ok(binding.contact.clone())
    }

    /// Record the outcome of a forwarded connect
    pub fn record_connect(&mut self, target: &SocketAddr, ok: bool, now: Instant) {
        if let Some(binding) = self.entries.get_mut(target) {
            if ok {
                binding.connect_ok(now);
            } else {
                binding.connect_failed(now);
            }
        }
    }

    /// Evict bindings not refreshed within the timeout
    pub fn sweep(&mut self, now: Instant) -> Vec<Contact> {
        let timeout = self.timeout;
        let mut evicted = Vec::new();
        self.entries.retain(|_, binding| {
            let alive = binding.age(now) <= timeout;
            if !alive {
                evicted.push(binding.contact.clone());
            }
            alive
        });
        evicted
    }

    /// Remove every binding
    pub fn drain(&mut self) -> Vec<Contact> {
        self.entries.drain().map(|(_, b)| b.contact).collect()
    }

    /// Binding for an address
    #[must_use]
    pub fn get(&self, address: &SocketAddr) -> Option<&Binding> {
        self.entries.get(address)
    }

    /// Number of bindings
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Diagnostic summaries of all bindings
    #[must_use]
    pub fn summaries(&self, now: Instant) -> Vec<BindingSummary> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .map(|(address, b)| BindingSummary {
                address: *address,
                ok_count: b.ok_count,
                consec_fails: b.consec_fails,
                age: b.age(now),
            })
            .collect();
        out.sort_by_key(|s| s.address);
        out
    }
}

/// Diagnostic view of one binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSummary {
    /// Bound peer
    pub address: SocketAddr,
    /// Successful connects
    pub ok_count: u32,
    /// Consecutive failed connects
    pub consec_fails: u32,
    /// Time since last bind
    pub age: Duration,
}

impl fmt::Display for BindingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->ok={};bad={};age={}",
            self.address,
            self.ok_count,
            self.consec_fails,
            self.age.as_millis()
        )
    }
}

impl PuncherInner {
    /// Accept or refuse a peer choosing us as its rendezvous
    ///
    /// The reply echoes the port the request arrived from, so the peer can
    /// see how its NAT mapped it.
    pub(crate) fn receive_bind(&self, originator: &Contact) -> PunchMessage {
        let port = Some(originator.transport_port());

        if self.role.is_secondary() {
            tracing::debug!(role = %self.role, "Refusing bind from {}", originator);
            self.counters.record_failure(FailureKind::Rejected);
            return PunchMessage::BindReply { ok: false, port };
        }

        let result = { self.bindings.lock().bind(originator.clone(), Instant::now()) };
        match &result {
            Ok(BindDisposition::Created) => tracing::info!("Accepted binding from {}", originator),
            Ok(BindDisposition::Refreshed) => tracing::trace!("Binding from {} refreshed", originator),
            Err(e) => {
                tracing::debug!("Refused binding from {}: {}", originator, e);
                self.counters.record_failure(e.kind());
            }
        }

        PunchMessage::BindReply {
            ok: result.is_ok(),
            port,
        }
    }

    /// A peer is going away; if it is our rendezvous, move on now
    pub(crate) fn receive_close(self: &Arc<Self>, originator: &Contact) -> PunchMessage {
        let target = { self.state.lock().target.clone() };
        if let Some(target) = target.filter(|t| t.id() == originator.id()) {
            self.rendezvous_failed(&target, FailoverReason::Closed);
        }
        PunchMessage::CloseReply { ok: true }
    }

    /// Tell a peer how its address looks from here
    pub(crate) fn receive_query(&self, originator: &Contact) -> PunchMessage {
        let observed = originator.transport_addr();
        PunchMessage::QueryReply {
            ok: true,
            ip: Some(observed.ip()),
            port: Some(observed.port()),
        }
    }

    /// Periodically evict stale bindings and spread identities over hosts
    pub(crate) fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(this) = weak.upgrade() else { break };
                if this.is_suspended() {
                    continue;
                }

                let evicted = { this.bindings.lock().sweep(Instant::now()) };
                for contact in evicted {
                    tracing::debug!("Binding from {} timed out", contact);
                }
                this.dedup_identities();
            }
        })
    }
}
