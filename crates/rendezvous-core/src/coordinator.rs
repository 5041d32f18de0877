//! Punch brokering: PUNCH, CONNECT and TUNNEL exchanges.
//!
//! ```text
//! originator            rendezvous             target
//!     |--PUNCH_REQUEST------>|                    |
//!     |                      |--CONNECT_REQUEST-->|
//!     |                      |<--CONNECT_REPLY----|  target probes originator
//!     |<--PUNCH_REPLY--------|                    |
//!     |--TUNNEL_OUTBOUND------------------------->|
//!     |<-------------------------TUNNEL_INBOUND---|
//! ```
//!
//! The originator learns the target's live external port from whichever
//! direct probe reaches it first; the latest observed port always wins.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::contact::Contact;
use crate::error::{PunchError, Result};
use crate::message::{ClientData, PunchMessage};
use crate::puncher::PuncherInner;
use crate::timer::TimerHandle;
use crate::transport::HANDLER_KEY;

/// Direction of a direct tunnel probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TunnelDirection {
    /// Target to originator
    Inbound,
    /// Originator to target
    Outbound,
}

impl TunnelDirection {
    fn message(self) -> PunchMessage {
        match self {
            Self::Inbound => PunchMessage::TunnelInbound,
            Self::Outbound => PunchMessage::TunnelOutbound,
        }
    }
}

struct PunchWait {
    id: u64,
    target: Contact,
    learned_port: Option<u16>,
    signal: Arc<Notify>,
}

/// Punches waiting for a tunnel probe from their target
pub(crate) struct OutstandingPunches {
    capacity: usize,
    next_id: u64,
    waits: Vec<PunchWait>,
}

impl OutstandingPunches {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: 0,
            waits: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, target: Contact) -> Result<(u64, Arc<Notify>)> {
        if self.waits.len() >= self.capacity {
            return Err(PunchError::capacity("too many outstanding punches"));
        }

        let id = self.next_id;
        self.next_id += 1;
        let signal = Arc::new(Notify::new());
        self.waits.push(PunchWait {
            id,
            target,
            learned_port: None,
            signal: Arc::clone(&signal),
        });
        Ok((id, signal))
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.waits.retain(|w| w.id != id);
    }

    pub(crate) fn learned_port(&self, id: u64) -> Option<u16> {
        self.waits
            .iter()
            .find(|w| w.id == id)
            .and_then(|w| w.learned_port)
    }

    /// A tunnel probe arrived from `from`; wake every punch aimed at its host
    pub(crate) fn tunnel_arrived(&mut self, from: &Contact) -> usize {
        let ip = from.address().ip();
        let mut matched = 0;
        for wait in self.waits.iter_mut().filter(|w| w.target.address().ip() == ip) {
            wait.learned_port = Some(from.transport_port());
            wait.signal.notify_one();
            matched += 1;
        }
        matched
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.waits.len()
    }
}

/// Keeps a punch registered for as long as the attempt runs
struct PunchRegistration<'a> {
    owner: &'a PuncherInner,
    id: u64,
    signal: Arc<Notify>,
}

impl<'a> PunchRegistration<'a> {
    fn new(owner: &'a PuncherInner, target: &Contact) -> Result<Self> {
        let (id, signal) = { owner.punches.lock().register(target.clone())? };
        Ok(Self { owner, id, signal })
    }

    fn learned_port(&self) -> Option<u16> {
        self.owner.punches.lock().learned_port(self.id)
    }
}

impl Drop for PunchRegistration<'_> {
    fn drop(&mut self) {
        self.owner.punches.lock().remove(self.id);
    }
}

impl PuncherInner {
    /// Send a request under the puncher handler key and decode the reply
    pub(crate) async fn send_request(
        &self,
        contact: &Contact,
        message: PunchMessage,
        timeout: Duration,
    ) -> Result<PunchMessage> {
        let kind = message.kind();
        self.counters.record_message(kind);

        let payload = message.encode()?;
        let reply = match self
            .transport
            .request(contact, &HANDLER_KEY, payload, timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::trace!("{} to {} failed: {}", kind, contact, e);
                return Err(e.into());
            }
        };

        PunchMessage::decode_reply(kind, &reply)
    }

    async fn send_tunnel(&self, contact: &Contact, direction: TunnelDirection) -> bool {
        let message = direction.message();
        self.counters.record_message(message.kind());

        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.record_failure(e.kind());
                return false;
            }
        };

        let sent = self
            .transport
            .send(contact, &HANDLER_KEY, payload, self.config.tunnel_timeout)
            .await;
        match sent {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!("Tunnel probe to {} failed: {}", contact, e);
                self.counters.record_failure(PunchError::from(e).kind());
                false
            }
        }
    }

    /// Probe `target` now, retrying on the timer pool until a probe goes through
    ///
    /// A saturated pool degrades to the single immediate probe.
    async fn probe_tunnel(
        self: &Arc<Self>,
        target: &Contact,
        direction: TunnelDirection,
    ) -> Option<TimerHandle> {
        let group = match direction {
            TunnelDirection::Inbound => &self.probe_inbound,
            TunnelDirection::Outbound => &self.probe_outbound,
        };

        let timer = if group.spare() > 2 {
            let weak = Arc::downgrade(self);
            let target = target.clone();
            group.spawn_repeating(self.config.probe_interval, self.config.probe_retries, move || {
                let weak = weak.clone();
                let target = target.clone();
                async move {
                    match weak.upgrade() {
                        Some(this) => this.send_tunnel(&target, direction).await,
                        None => true,
                    }
                }
            })
        } else {
            None
        };
        if timer.is_none() {
            tracing::trace!("Timer group {} saturated, single tunnel probe", group.name());
        }

        if self.send_tunnel(target, direction).await {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            return None;
        }
        timer
    }

    /// Originator side of a punch
    pub(crate) async fn send_punch(
        self: &Arc<Self>,
        rendezvous: &Contact,
        target: &Contact,
        client_data: Option<ClientData>,
        message_only: bool,
    ) -> Result<ClientData> {
        let registration = PunchRegistration::new(self, target)?;

        let request = PunchMessage::PunchRequest {
            target: target.address(),
            client_data,
            message_only,
        };
        let reply = self
            .send_request(rendezvous, request, self.config.punch_timeout(message_only))
            .await?;

        let PunchMessage::PunchReply {
            ok: true,
            port,
            client_data,
        } = reply
        else {
            return Err(PunchError::Denied(rendezvous.address()));
        };

        if let Some(port) = port {
            if target.correct_port(port) {
                tracing::debug!("Rendezvous reports port {} for {}", port, target);
            }
        }

        if !message_only {
            let probes = self.probe_tunnel(target, TunnelDirection::Outbound).await;
            let arrived =
                tokio::time::timeout(self.config.tunnel_wait, registration.signal.notified())
                    .await
                    .is_ok();

            if arrived {
                if let Some(probes) = probes {
                    probes.cancel();
                }
                if let Some(port) = registration.learned_port() {
                    if target.correct_port(port) {
                        tracing::debug!("Tunnel probe corrected port for {} to {}", target, port);
                    }
                }
            } else {
                tracing::trace!("No tunnel probe from {} within {:?}", target, self.config.tunnel_wait);
            }
        }

        Ok(client_data.unwrap_or_default())
    }

    /// Rendezvous side: forward a punch to the bound target
    pub(crate) async fn receive_punch(
        &self,
        originator: &Contact,
        target: SocketAddr,
        client_data: Option<ClientData>,
        message_only: bool,
    ) -> PunchMessage {
        let result = self
            .broker_punch(originator, target, client_data, message_only)
            .await;
        self.counters.record_punch_brokered(result.is_ok());

        match result {
            Ok((bound, client_data)) => PunchMessage::PunchReply {
                ok: true,
                port: Some(bound.transport_port()),
                client_data,
            },
            Err(e) => {
                tracing::debug!("Punch from {} to {} failed: {}", originator, target, e);
                self.counters.record_failure(e.kind());
                PunchMessage::PunchReply {
                    ok: false,
                    port: None,
                    client_data: None,
                }
            }
        }
    }

    async fn broker_punch(
        &self,
        originator: &Contact,
        target: SocketAddr,
        client_data: Option<ClientData>,
        message_only: bool,
    ) -> Result<(Contact, Option<ClientData>)> {
        let bound = { self.bindings.lock().connect_target(&target, Instant::now())? };

        let result = self
            .send_connect(originator, &bound, client_data, message_only)
            .await;
        {
            self.bindings
                .lock()
                .record_connect(&target, result.is_ok(), Instant::now());
        }

        result.map(|client_data| (bound, client_data))
    }

    async fn send_connect(
        &self,
        originator: &Contact,
        target: &Contact,
        client_data: Option<ClientData>,
        message_only: bool,
    ) -> Result<Option<ClientData>> {
        let request = PunchMessage::ConnectRequest {
            origin: self.transport.export_contact(originator)?,
            port: originator.transport_port(),
            client_data,
            message_only,
        };

        match self
            .send_request(target, request, self.config.transfer_timeout)
            .await?
        {
            PunchMessage::ConnectReply {
                ok: true,
                client_data,
            } => Ok(client_data),
            _ => Err(PunchError::Denied(target.address())),
        }
    }

    /// Target side: accept a connect forwarded by our rendezvous
    pub(crate) async fn receive_connect(
        self: &Arc<Self>,
        rendezvous: &Contact,
        origin: &[u8],
        port: u16,
        client_data: Option<ClientData>,
        message_only: bool,
    ) -> PunchMessage {
        match self
            .accept_connect(rendezvous, origin, port, client_data, message_only)
            .await
        {
            Ok(client_data) => PunchMessage::ConnectReply {
                ok: true,
                client_data,
            },
            Err(e) => {
                tracing::debug!("Refused connect via {}: {}", rendezvous, e);
                self.counters.record_failure(e.kind());
                PunchMessage::ConnectReply {
                    ok: false,
                    client_data: None,
                }
            }
        }
    }

    async fn accept_connect(
        self: &Arc<Self>,
        rendezvous: &Contact,
        origin: &[u8],
        port: u16,
        client_data: Option<ClientData>,
        message_only: bool,
    ) -> Result<Option<ClientData>> {
        let current = { self.state.lock().target.clone() };
        if current.is_none_or(|t| t.address() != rendezvous.address()) {
            return Err(PunchError::InvalidRendezvous(rendezvous.address()));
        }

        let origin = self.transport.import_contact(origin)?;
        origin.correct_port(port);

        if !message_only {
            // Retries continue on the timer pool after we reply
            let _probes = self.probe_tunnel(&origin, TunnelDirection::Inbound).await;
        }

        Ok(self
            .adapter
            .client_data(origin.transport_addr(), &client_data.unwrap_or_default()))
    }

    /// A direct probe from `from` reached us
    pub(crate) fn receive_tunnel(&self, from: &Contact) -> usize {
        let matched = { self.punches.lock().tunnel_arrived(from) };
        if matched == 0 {
            tracing::trace!("Tunnel probe from {} matched no punch", from);
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Contact {
        Contact::from_address("10.0.0.1:6881".parse().unwrap())
    }

    #[test]
    fn test_capacity() {
        let mut punches = OutstandingPunches::new(2);
        let (a, _) = punches.register(target()).unwrap();
        punches.register(target()).unwrap();

        let err = punches.register(target()).unwrap_err();
        assert!(matches!(err, PunchError::Capacity(_)));

        punches.remove(a);
        assert!(punches.register(target()).is_ok());
        assert_eq!(punches.len(), 2);
    }

    #[tokio::test]
    async fn test_tunnel_arrival_signals_and_learns_port() {
        let mut punches = OutstandingPunches::new(4);
        let (id, signal) = punches.register(target()).unwrap();
        let (other, _) = punches
            .register(Contact::from_address("10.0.0.9:6881".parse().unwrap()))
            .unwrap();

        assert_eq!(punches.tunnel_arrived(&target().observed_from(40001)), 1);
        assert_eq!(punches.learned_port(id), Some(40001));
        assert_eq!(punches.learned_port(other), None);

        // Permit is stored, so a later wait completes at once
        tokio::time::timeout(Duration::from_millis(10), signal.notified())
            .await
            .unwrap();
    }

    #[test]
    fn test_port_correction_is_idempotent() {
        let mut punches = OutstandingPunches::new(4);
        let recorded = target();
        let (id, _) = punches.register(recorded.clone()).unwrap();

        let probe = target().observed_from(40002);
        punches.tunnel_arrived(&probe);
        punches.tunnel_arrived(&probe);
        let port = punches.learned_port(id).unwrap();

        assert!(recorded.correct_port(port));
        assert!(!recorded.correct_port(port));
        assert_eq!(recorded.transport_port(), 40002);

        // Latest probe wins
        punches.tunnel_arrived(&target().observed_from(40003));
        assert!(recorded.correct_port(punches.learned_port(id).unwrap()));
        assert_eq!(recorded.transport_port(), 40003);
    }

    #[test]
    fn test_removed_wait_is_not_signalled() {
        let mut punches = OutstandingPunches::new(4);
        let (id, _) = punches.register(target()).unwrap();
        punches.remove(id);
        assert_eq!(punches.tunnel_arrived(&target().observed_from(40001)), 0);
        assert_eq!(punches.len(), 0);
    }
}
