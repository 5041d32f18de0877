//! Application hook consulted when a connect request is accepted.

use std::net::SocketAddr;

use crate::message::ClientData;

/// Supplies the payload a target returns to a punching originator
///
/// Implemented for plain closures, so an embedding application can pass
/// `|observed, data| Some(reply)` directly.
pub trait PunchAdapter: Send + Sync + 'static {
    /// Build the reply payload for an originator observed at `observed`
    fn client_data(&self, observed: SocketAddr, originator_data: &ClientData)
    -> Option<ClientData>;
}

impl<F> PunchAdapter for F
where
    F: Fn(SocketAddr, &ClientData) -> Option<ClientData> + Send + Sync + 'static,
{
    fn client_data(
        &self,
        observed: SocketAddr,
        originator_data: &ClientData,
    ) -> Option<ClientData> {
        self(observed, originator_data)
    }
}

/// Adapter that never attaches a payload
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClientData;

impl PunchAdapter for NoClientData {
    fn client_data(&self, _observed: SocketAddr, _originator_data: &ClientData) -> Option<ClientData> {
        None
    }
}
