//! Transport contacts with NAT port correction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::Result;

/// Contact identifier length in bytes
pub const CONTACT_ID_LEN: usize = 20;

/// Contact identifier
pub type ContactId = [u8; CONTACT_ID_LEN];

/// Current contact serialization version
pub const CONTACT_VERSION: u8 = 1;

/// An addressable transport endpoint
///
/// `address` is the endpoint as advertised in the DHT and never changes. The
/// transport port is where packets actually get delivered; NAT devices often
/// remap it, so it is corrected in place whenever a live packet reveals a
/// different one. Clones share the recorded transport port.
#[derive(Clone)]
pub struct Contact {
    id: ContactId,
    address: SocketAddr,
    version: u8,
    transport_port: Arc<AtomicU16>,
}

impl Contact {
    /// Create a contact whose transport port equals its advertised port
    #[must_use]
    pub fn new(id: ContactId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            version: CONTACT_VERSION,
            transport_port: Arc::new(AtomicU16::new(address.port())),
        }
    }

    /// Create a contact for a bare address, deriving its id from the address
    #[must_use]
    pub fn from_address(address: SocketAddr) -> Self {
        Self::new(derive_id(address), address)
    }

    /// Independent copy with a different transport port
    ///
    /// Used by transports to describe a sender as observed on the wire.
    #[must_use]
    pub fn observed_from(&self, port: u16) -> Self {
        Self {
            id: self.id,
            address: self.address,
            version: self.version,
            transport_port: Arc::new(AtomicU16::new(port)),
        }
    }

    /// Contact identifier
    #[must_use]
    pub fn id(&self) -> &ContactId {
        &self.id
    }

    /// Advertised address
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Serialization version
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Currently recorded transport port
    #[must_use]
    pub fn transport_port(&self) -> u16 {
        self.transport_port.load(Ordering::Acquire)
    }

    /// Address packets are sent to: advertised ip, corrected port
    #[must_use]
    pub fn transport_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address.ip(), self.transport_port())
    }

    /// Overwrite the recorded port with one learned from a live packet
    ///
    /// Returns `true` if the port changed. Zero is never recorded.
    pub fn correct_port(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        self.transport_port.swap(port, Ordering::AcqRel) != port
    }

    /// Check whether two contacts share an ip address
    #[must_use]
    pub fn same_ip(&self, other: &Contact) -> bool {
        self.address.ip() == other.address.ip()
    }

    /// Serializable form of this contact
    #[must_use]
    pub fn to_record(&self) -> ContactRecord {
        ContactRecord {
            id: self.id,
            address: self.address,
            transport_port: self.transport_port(),
            version: self.version,
        }
    }

    /// Encode to bytes
    ///
    /// # Errors
    ///
    /// Returns a decode error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.to_record())?)
    }

    /// Decode from bytes produced by [`Contact::encode`]
    ///
    /// # Errors
    ///
    /// Returns a decode error if the bytes are malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let record: ContactRecord = bincode::deserialize(bytes)?;
        Ok(record.into())
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.address.hash(state);
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &hex::encode(&self.id[..4]))
            .field("address", &self.address)
            .field("transport_port", &self.transport_port())
            .finish()
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", hex::encode(&self.id[..4]), self.address)?;
        let port = self.transport_port();
        if port != self.address.port() {
            write!(f, "/{port}")?;
        }
        Ok(())
    }
}

/// Wire form of a [`Contact`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    /// Contact identifier
    pub id: ContactId,
    /// Advertised address
    pub address: SocketAddr,
    /// Transport port as known to the exporter
    pub transport_port: u16,
    /// Serialization version
    pub version: u8,
}

impl From<ContactRecord> for Contact {
    fn from(record: ContactRecord) -> Self {
        Self {
            id: record.id,
            address: record.address,
            version: record.version,
            transport_port: Arc::new(AtomicU16::new(record.transport_port)),
        }
    }
}

/// Derive a contact id from an address
fn derive_id(address: SocketAddr) -> ContactId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"rendezvous-contact-id");
    hasher.update(address.to_string().as_bytes());
    let hash = hasher.finalize();

    let mut id = [0u8; CONTACT_ID_LEN];
    id.copy_from_slice(&hash.as_bytes()[..CONTACT_ID_LEN]);
    id
}
