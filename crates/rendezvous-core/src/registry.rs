//! Routing of inbound requests to the identity that owns them.
//!
//! All identities share one transport handler. Connect and close requests come
//! from an identity's rendezvous, so they are routed by the originator's
//! address to whichever identity currently targets that rendezvous.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

/// Map from rendezvous address to the identity bound to it
pub(crate) struct IdentityRegistry<T> {
    owners: DashMap<SocketAddr, (u64, Weak<T>)>,
}

impl<T> IdentityRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            owners: DashMap::new(),
        }
    }

    /// Record that identity `serial` moved from `old` to `new`
    pub(crate) fn update(
        &self,
        serial: u64,
        identity: &Weak<T>,
        old: Option<SocketAddr>,
        new: Option<SocketAddr>,
    ) {
        if let Some(old) = old {
            // Another identity may have claimed the address since
            self.owners.remove_if(&old, |_, (owner, _)| *owner == serial);
        }
        if let Some(new) = new {
            self.owners.insert(new, (serial, Weak::clone(identity)));
        }
    }

    /// Identity currently bound to `rendezvous`
    pub(crate) fn owner(&self, rendezvous: &SocketAddr) -> Option<Arc<T>> {
        self.owners
            .get(rendezvous)
            .and_then(|entry| entry.value().1.upgrade())
    }

    /// Drop every entry owned by identity `serial`
    pub(crate) fn forget(&self, serial: u64) {
        self.owners.retain(|_, (owner, _)| *owner != serial);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.owners.len()
    }
}
