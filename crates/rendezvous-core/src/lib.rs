//! # Rendezvous Core
//!
//! DHT-assisted NAT traversal: lets two peers that are both behind NAT reach
//! each other directly, using a third, reachable peer found through the DHT as
//! a rendezvous.
//!
//! This crate provides:
//! - The puncher message codec and per-kind counters
//! - Rendezvous discovery and publishing for unreachable nodes
//! - Re-binding with failure detection and failover
//! - The rendezvous server's binding table
//! - Punch coordination with NAT port correction
//! - An in-memory simulated network for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Puncher (primary + secondaries)                │
//! ├──────────────────────┬──────────────────────┬───────────────────┤
//! │  Publisher           │  Maintainer          │  Server           │
//! │  (find rendezvous)   │  (bind, fail over)   │  (binding table)  │
//! ├──────────────────────┴──────────────────────┴───────────────────┤
//! │        Coordinator (PUNCH / CONNECT / TUNNEL) + lookup cache    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │              PunchTransport + Dht (collaborators)               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod config;
pub mod contact;
mod coordinator;
pub mod dht;
pub mod error;
pub mod failed;
pub mod listener;
pub mod lookup;
pub mod maintainer;
pub mod message;
mod publisher;
pub mod puncher;
mod registry;
pub mod server;
pub mod sim;
pub mod stats;
mod sync;
pub mod timer;
pub mod transport;

pub use adapter::{NoClientData, PunchAdapter};
pub use config::PuncherConfig;
pub use contact::Contact;
pub use dht::Dht;
pub use error::{FailureKind, PunchError, Result, TransportError};
pub use listener::{ListenerId, RendezvousListener};
pub use maintainer::RendezvousPhase;
pub use message::{ClientData, MessageKind, PunchMessage};
pub use puncher::{Puncher, Role};
pub use stats::StatsSnapshot;
pub use transport::{PunchTransport, TransferHandler, TransportEvent};
