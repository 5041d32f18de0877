//! DHT collaborator abstraction and the rendezvous record format.
//!
//! A node behind NAT stores a single record in the DHT under
//! [`publish_key`] of its own contact. The value is a version byte followed
//! by the exported contact of its current rendezvous.

use async_trait::async_trait;
use std::time::Duration;

use crate::contact::Contact;
use crate::error::{PunchError, Result};
use crate::transport::PunchTransport;

/// Version tag of the rendezvous record
pub const RECORD_VERSION: u8 = 0;

/// DHT key length
pub const DHT_KEY_LEN: usize = 20;

/// DHT key
pub type DhtKey = [u8; DHT_KEY_LEN];

/// Options attached to a put
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutFlags {
    /// Replace any earlier value from the same writer
    pub single_value: bool,
}

impl PutFlags {
    /// Flags for rendezvous records
    pub const SINGLE_VALUE: Self = Self { single_value: true };
}

/// Outcome of a DHT get
#[derive(Debug, Clone, Default)]
pub struct DhtLookup {
    /// Values found, at most the requested count
    pub values: Vec<Vec<u8>>,
    /// Whether the lookup ended by timing out
    pub timed_out: bool,
}

/// Distributed hash table used to publish and find rendezvous records
#[async_trait]
pub trait Dht: Send + Sync + 'static {
    /// Look up at most `max_values` values under `key`
    async fn get(&self, key: &DhtKey, max_values: usize, timeout: Duration) -> DhtLookup;

    /// Store a value, returning the contacts that accepted the write
    async fn put(&self, key: &DhtKey, value: Vec<u8>, flags: PutFlags) -> Vec<Contact>;

    /// Remove our value under `key` from wherever it was written
    async fn remove(&self, key: &DhtKey);

    /// Remove our value under `key` from the given write set only
    async fn remove_from(&self, targets: &[Contact], key: &DhtKey);
}

/// DHT key under which `contact` publishes its rendezvous
///
/// # Example
///
/// ```
/// use rendezvous_core::{Contact, dht::publish_key};
///
/// let contact = Contact::from_address("10.0.0.1:6881".parse().unwrap());
/// assert_eq!(publish_key(&contact), publish_key(&contact.clone()));
/// ```
#[must_use]
pub fn publish_key(contact: &Contact) -> DhtKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(contact.id());
    hasher.update(b"rendezvous-publish"); // Domain separation

    let hash = hasher.finalize();
    let mut key = [0u8; DHT_KEY_LEN];
    key.copy_from_slice(&hash.as_bytes()[..DHT_KEY_LEN]);
    key
}

/// Encode the record value naming `rendezvous`
///
/// # Errors
///
/// Returns a decode error if the contact cannot be exported.
pub fn encode_record(transport: &dyn PunchTransport, rendezvous: &Contact) -> Result<Vec<u8>> {
    let contact = transport.export_contact(rendezvous)?;
    let mut value = Vec::with_capacity(contact.len() + 1);
    value.push(RECORD_VERSION);
    value.extend_from_slice(&contact);
    Ok(value)
}

/// Decode a record value into the rendezvous contact it names
///
/// # Errors
///
/// Returns [`PunchError::UnsupportedVersion`] for an unknown version tag and a
/// decode error for an empty value or malformed contact.
pub fn decode_record(transport: &dyn PunchTransport, value: &[u8]) -> Result<Contact> {
    let (&version, contact) = value
        .split_first()
        .ok_or(PunchError::decode("empty rendezvous record"))?;

    if version != RECORD_VERSION {
        return Err(PunchError::UnsupportedVersion(version));
    }

    transport.import_contact(contact)
}
