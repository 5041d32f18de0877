//! Transport collaborator abstraction.
//!
//! The puncher never touches sockets itself. It drives an implementation of
//! [`PunchTransport`], which offers pings, request/reply exchanges, fire-and-forget
//! sends and contact serialization, and which delivers inbound requests to a
//! registered [`TransferHandler`].

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::contact::Contact;
use crate::error::{PunchError, Result, TransportError};

/// Key identifying a transfer handler
pub type HandlerKey = [u8; 20];

/// Name hashed into [`HANDLER_KEY`]
const HANDLER_NAME: &str = "Rendezvous:Puncher:TransferHandlerKey";

/// Handler key all puncher messages travel under
pub static HANDLER_KEY: LazyLock<HandlerKey> = LazyLock::new(|| {
    let digest = Sha1::digest(HANDLER_NAME.as_bytes());
    let mut key = [0u8; 20];
    key.copy_from_slice(&digest);
    key
});

/// Change notifications emitted by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The local contact (advertised address) changed
    LocalContactChanged(SocketAddr),
    /// Direct reachability from the internet changed
    ReachabilityChanged(bool),
}

/// Receiver of inbound requests for one handler key
#[async_trait]
pub trait TransferHandler: Send + Sync {
    /// Handler name, used in logs
    fn name(&self) -> &str;

    /// Handle a request from `originator` (as observed on the wire)
    ///
    /// Returns the reply bytes, or `None` if no reply should be sent.
    async fn handle(&self, originator: Contact, payload: Vec<u8>) -> Option<Vec<u8>>;
}

/// Async transport used by a puncher.
///
/// One transport is shared by the primary identity and all its secondaries.
#[async_trait]
pub trait PunchTransport: Send + Sync + 'static {
    /// Our contact as advertised in the DHT
    fn local_contact(&self) -> Contact;

    /// Whether peers can reach us directly
    fn is_reachable(&self) -> bool;

    /// Contacts currently believed to be directly reachable
    fn reachable_contacts(&self) -> Vec<Contact>;

    /// Ping a contact
    ///
    /// # Errors
    ///
    /// Returns a transport error on timeout or if the contact is unreachable.
    async fn ping(&self, contact: &Contact) -> std::result::Result<(), TransportError>;

    /// Send a request and wait for the reply
    ///
    /// # Errors
    ///
    /// Returns a transport error on timeout or delivery failure.
    async fn request(
        &self,
        contact: &Contact,
        key: &HandlerKey,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, TransportError>;

    /// Send without waiting for a reply
    ///
    /// # Errors
    ///
    /// Returns a transport error if the packet could not be written.
    async fn send(
        &self,
        contact: &Contact,
        key: &HandlerKey,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> std::result::Result<(), TransportError>;

    /// Register the handler for inbound requests under `key`
    fn register_handler(&self, key: HandlerKey, handler: Arc<dyn TransferHandler>);

    /// Remove the handler registered under `key`
    fn unregister_handler(&self, key: &HandlerKey);

    /// Subscribe to local contact and reachability changes
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Build a contact for a bare address
    fn contact_for_address(&self, address: SocketAddr) -> Contact {
        Contact::from_address(address)
    }

    /// Serialize a contact
    ///
    /// # Errors
    ///
    /// Returns a decode error if the contact cannot be serialized.
    fn export_contact(&self, contact: &Contact) -> Result<Vec<u8>> {
        contact.encode()
    }

    /// Deserialize a contact
    ///
    /// # Errors
    ///
    /// Returns a decode error if the bytes are malformed.
    fn import_contact(&self, bytes: &[u8]) -> Result<Contact> {
        Contact::decode(bytes).map_err(|e| match e {
            PunchError::Decode(msg) => PunchError::Decode(format!("bad contact: {msg}").into()),
            other => other,
        })
    }
}
