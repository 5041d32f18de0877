//! Error types for the rendezvous engine
//!
//! Almost every failure in this crate is expected: peers vanish, NAT mappings
//! expire and requests time out. Network-facing operations therefore absorb
//! their errors, count them by [`FailureKind`] and surface only an empty result.
//! The only errors that cross the [`Puncher`](crate::Puncher) boundary are
//! misuse and configuration errors.
//!
//! # Error Categories
//!
//! - **Transient**: timeouts and unreachable peers, retried on the next tick
//! - **Denial**: explicit rejection by a peer, escalated immediately
//! - **Decode**: malformed contacts or records, treated as "no result"
//! - **Capacity**: bounded tables that refuse new entries
//! - **Misuse**: local programming errors, reported synchronously

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

use crate::message::MessageKind;

/// Errors produced by the transport collaborator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No reply arrived within the request timeout
    #[error("request timed out")]
    Timeout,

    /// The destination could not be reached
    #[error("destination {0} unreachable")]
    Unreachable(SocketAddr),

    /// The destination accepted the request but produced no reply
    #[error("no reply from {0}")]
    NoReply(SocketAddr),

    /// The transport has been shut down
    #[error("transport closed")]
    Closed,

    /// Any other transport failure
    #[error("transport failure: {0}")]
    Other(Cow<'static, str>),
}

/// Errors that can occur while finding, maintaining or using a rendezvous
#[derive(Debug, Error, Clone)]
pub enum PunchError {
    // ============ Network Errors ============
    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Peer explicitly refused the request
    #[error("Request denied by {0}")]
    Denied(SocketAddr),

    // ============ Decoding Errors ============
    /// Message, contact or record could not be decoded
    #[error("Decode error: {0}")]
    Decode(Cow<'static, str>),

    /// Rendezvous record carries an unknown version tag
    #[error("Unsupported rendezvous record version {0}")]
    UnsupportedVersion(u8),

    /// Reply had the wrong message kind
    #[error("Unexpected reply: expected {expected:?}, got {actual:?}")]
    UnexpectedReply {
        /// Kind that should have arrived
        expected: MessageKind,
        /// Kind that did arrive
        actual: MessageKind,
    },

    // ============ Rendezvous Errors ============
    /// A bounded table refused a new entry
    #[error("Capacity exhausted: {0}")]
    Capacity(Cow<'static, str>),

    /// No rendezvous is published for the target
    #[error("No rendezvous known for {0}")]
    NoRendezvous(SocketAddr),

    /// A connect request arrived from a node that is not our rendezvous
    #[error("Connect request from {0}, which is not the current rendezvous")]
    InvalidRendezvous(SocketAddr),

    /// No binding is held for the named target
    #[error("No binding held for {0}")]
    UnknownBinding(SocketAddr),

    /// Binding is quarantined after repeated connect failures
    #[error("Binding for {0} quarantined after repeated connect failures")]
    Quarantined(SocketAddr),

    // ============ Local Errors ============
    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// API used in a way it does not support
    #[error("Misuse: {0}")]
    Misuse(Cow<'static, str>),
}

impl PunchError {
    /// Check whether retrying later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::Timeout | TransportError::Unreachable(_))
                | Self::Transport(TransportError::NoReply(_))
                | Self::Quarantined(_)
        )
    }

    /// Check whether this is a local programming error
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::Misuse(_) | Self::InvalidConfig(_))
    }

    /// Category used for failure counters
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transport(TransportError::Timeout) => FailureKind::Timeout,
            Self::Transport(_) => FailureKind::Unreachable,
            Self::Denied(_) => FailureKind::Denied,
            Self::Decode(_) | Self::UnsupportedVersion(_) | Self::UnexpectedReply { .. } => {
                FailureKind::Decode
            }
            Self::Capacity(_) => FailureKind::Capacity,
            Self::NoRendezvous(_) => FailureKind::NoRendezvous,
            Self::InvalidRendezvous(_) | Self::UnknownBinding(_) | Self::Quarantined(_) => {
                FailureKind::Rejected
            }
            Self::InvalidConfig(_) | Self::Misuse(_) => FailureKind::Misuse,
        }
    }

    /// Create a decode error
    #[must_use]
    pub const fn decode(msg: &'static str) -> Self {
        Self::Decode(Cow::Borrowed(msg))
    }

    /// Create a capacity error
    #[must_use]
    pub const fn capacity(msg: &'static str) -> Self {
        Self::Capacity(Cow::Borrowed(msg))
    }

    /// Create a configuration error
    #[must_use]
    pub const fn invalid_config(msg: &'static str) -> Self {
        Self::InvalidConfig(Cow::Borrowed(msg))
    }

    /// Create a misuse error
    #[must_use]
    pub const fn misuse(msg: &'static str) -> Self {
        Self::Misuse(Cow::Borrowed(msg))
    }
}

impl From<serde_json::Error> for PunchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(Cow::Owned(err.to_string()))
    }
}

impl From<bincode::Error> for PunchError {
    fn from(err: bincode::Error) -> Self {
        Self::Decode(Cow::Owned(err.to_string()))
    }
}

/// Countable category of an absorbed failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Request timed out
    Timeout,
    /// Destination unreachable or transport failure
    Unreachable,
    /// Explicit denial by a peer
    Denied,
    /// Undecodable message, contact or record
    Decode,
    /// Bounded table full
    Capacity,
    /// No rendezvous published for a target
    NoRendezvous,
    /// Request refused locally (spoofed connect, unknown or quarantined binding)
    Rejected,
    /// Local misuse
    Misuse,
}

impl FailureKind {
    /// Number of failure kinds
    pub const COUNT: usize = 8;

    /// All kinds in counter order
    pub const ALL: [Self; Self::COUNT] = [
        Self::Timeout,
        Self::Unreachable,
        Self::Denied,
        Self::Decode,
        Self::Capacity,
        Self::NoRendezvous,
        Self::Rejected,
        Self::Misuse,
    ];

    /// Counter slot for this kind
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Short label used in stats output
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Unreachable => "unreachable",
            Self::Denied => "denied",
            Self::Decode => "decode",
            Self::Capacity => "capacity",
            Self::NoRendezvous => "norv",
            Self::Rejected => "rejected",
            Self::Misuse => "misuse",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result type for rendezvous operations
pub type Result<T> = std::result::Result<T, PunchError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "10.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn test_transient_classification() {
        assert!(PunchError::Transport(TransportError::Timeout).is_transient());
        assert!(PunchError::Transport(TransportError::Unreachable(addr())).is_transient());
        assert!(PunchError::Quarantined(addr()).is_transient());
        assert!(!PunchError::Denied(addr()).is_transient());
        assert!(!PunchError::decode("bad").is_transient());
    }

    #[test]
    fn test_misuse_classification() {
        assert!(PunchError::misuse("secondary").is_misuse());
        assert!(PunchError::invalid_config("zero").is_misuse());
        assert!(!PunchError::NoRendezvous(addr()).is_misuse());
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(
            PunchError::Transport(TransportError::Timeout).kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            PunchError::Transport(TransportError::Closed).kind(),
            FailureKind::Unreachable
        );
        assert_eq!(PunchError::UnsupportedVersion(3).kind(), FailureKind::Decode);
        assert_eq!(
            PunchError::capacity("table full").kind(),
            FailureKind::Capacity
        );
        assert_eq!(
            PunchError::InvalidRendezvous(addr()).kind(),
            FailureKind::Rejected
        );
    }

    #[test]
    fn test_failure_kind_indices_are_dense() {
        for (i, kind) in FailureKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn test_error_display() {
        let err = PunchError::UnsupportedVersion(7);
        assert_eq!(err.to_string(), "Unsupported rendezvous record version 7");

        let err = PunchError::from(TransportError::Unreachable(addr()));
        assert!(err.to_string().contains("10.0.0.1:6881"));
    }
}
