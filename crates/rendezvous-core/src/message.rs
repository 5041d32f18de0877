//! Wire messages exchanged between punchers.
//!
//! Every message is a flat JSON object whose `type` field names one of twelve
//! kinds. Requests travel through the transport's request/reply channel under
//! [`HANDLER_KEY`](crate::transport::HANDLER_KEY); the two tunnel kinds are sent
//! fire-and-forget and have no reply. Unknown keys are ignored on decode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::{PunchError, Result};

/// Opaque application payload carried alongside punches
pub type ClientData = BTreeMap<String, serde_json::Value>;

/// Kind of a [`PunchMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Client asks a rendezvous to hold a binding
    BindRequest = 0,
    /// Rendezvous answers a bind
    BindReply = 1,
    /// Originator asks a rendezvous to broker a punch
    PunchRequest = 2,
    /// Rendezvous answers a punch
    PunchReply = 3,
    /// Rendezvous forwards a punch to the bound target
    ConnectRequest = 4,
    /// Target answers a connect
    ConnectReply = 5,
    /// Direct probe from target to originator
    TunnelInbound = 6,
    /// Direct probe from originator to target
    TunnelOutbound = 7,
    /// Ask a peer for our observed address
    QueryRequest = 8,
    /// Observed address reply
    QueryReply = 9,
    /// Binding teardown notice
    CloseRequest = 10,
    /// Teardown acknowledgement
    CloseReply = 11,
}

impl MessageKind {
    /// Number of message kinds
    pub const COUNT: usize = 12;

    /// All kinds in wire order
    pub const ALL: [Self; Self::COUNT] = [
        Self::BindRequest,
        Self::BindReply,
        Self::PunchRequest,
        Self::PunchReply,
        Self::ConnectRequest,
        Self::ConnectReply,
        Self::TunnelInbound,
        Self::TunnelOutbound,
        Self::QueryRequest,
        Self::QueryReply,
        Self::CloseRequest,
        Self::CloseReply,
    ];

    /// Counter slot for this kind
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Kind of the reply a request expects, if any
    #[must_use]
    pub const fn reply(self) -> Option<Self> {
        match self {
            Self::BindRequest => Some(Self::BindReply),
            Self::PunchRequest => Some(Self::PunchReply),
            Self::ConnectRequest => Some(Self::ConnectReply),
            Self::QueryRequest => Some(Self::QueryReply),
            Self::CloseRequest => Some(Self::CloseReply),
            _ => None,
        }
    }
}

/// A puncher protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PunchMessage {
    /// Register the sender as bound to this rendezvous
    BindRequest,

    /// Bind outcome and the sender's port as observed by the rendezvous
    BindReply {
        /// Whether the binding was accepted
        ok: bool,
        /// Observed source port of the bind request
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },

    /// Ask the rendezvous to broker a punch to `target`
    PunchRequest {
        /// Advertised address of the bound target
        target: SocketAddr,
        /// Payload handed to the target's adapter
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_data: Option<ClientData>,
        /// Relay the payload without opening a tunnel
        #[serde(default)]
        message_only: bool,
    },

    /// Punch outcome relayed from the target
    PunchReply {
        /// Whether the target accepted
        ok: bool,
        /// Target's transport port as observed by the rendezvous
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        /// Target's reply payload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_data: Option<ClientData>,
    },

    /// Forwarded punch, sent by the rendezvous to the bound target
    ConnectRequest {
        /// Exported originator contact
        #[serde(with = "hex_bytes")]
        origin: Vec<u8>,
        /// Originator's transport port as observed by the rendezvous
        port: u16,
        /// Originator payload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_data: Option<ClientData>,
        /// Relay the payload without opening a tunnel
        #[serde(default)]
        message_only: bool,
    },

    /// Connect outcome
    ConnectReply {
        /// Whether the target accepted
        ok: bool,
        /// Target's reply payload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_data: Option<ClientData>,
    },

    /// Direct probe, target to originator
    TunnelInbound,

    /// Direct probe, originator to target
    TunnelOutbound,

    /// Ask for the sender's observed address
    QueryRequest,

    /// Sender's observed address
    QueryReply {
        /// Whether the address is present
        ok: bool,
        /// Observed ip
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<IpAddr>,
        /// Observed port
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },

    /// The sender is shutting down its rendezvous duty
    CloseRequest,

    /// Close acknowledgement
    CloseReply {
        /// Always true
        ok: bool,
    },
}

impl PunchMessage {
    /// Kind of this message
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::BindRequest => MessageKind::BindRequest,
            Self::BindReply { .. } => MessageKind::BindReply,
            Self::PunchRequest { .. } => MessageKind::PunchRequest,
            Self::PunchReply { .. } => MessageKind::PunchReply,
            Self::ConnectRequest { .. } => MessageKind::ConnectRequest,
            Self::ConnectReply { .. } => MessageKind::ConnectReply,
            Self::TunnelInbound => MessageKind::TunnelInbound,
            Self::TunnelOutbound => MessageKind::TunnelOutbound,
            Self::QueryRequest => MessageKind::QueryRequest,
            Self::QueryReply { .. } => MessageKind::QueryReply,
            Self::CloseRequest => MessageKind::CloseRequest,
            Self::CloseReply { .. } => MessageKind::CloseReply,
        }
    }

    /// Serialize to wire bytes
    ///
    /// # Errors
    ///
    /// Returns a decode error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from wire bytes
    ///
    /// # Errors
    ///
    /// Returns a decode error for malformed input or an unknown `type`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode a reply, checking it answers `request`
    ///
    /// # Errors
    ///
    /// Returns a decode error for malformed input, or
    /// [`PunchError::UnexpectedReply`] if the kind does not match.
    pub fn decode_reply(request: MessageKind, bytes: &[u8]) -> Result<Self> {
        let reply = Self::decode(bytes)?;
        match request.reply() {
            Some(expected) if expected == reply.kind() => Ok(reply),
            Some(expected) => Err(PunchError::UnexpectedReply {
                expected,
                actual: reply.kind(),
            }),
            None => Err(PunchError::decode("message kind has no reply")),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_type_tags() {
        let bytes = PunchMessage::BindRequest.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"type": "BIND_REQUEST"}));

        let bytes = PunchMessage::CloseReply { ok: true }.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"type": "CLOSE_REPLY", "ok": true}));
    }

    #[test]
    fn test_kind_indices_match_wire_order() {
        for (i, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert_eq!(MessageKind::TunnelInbound.reply(), None);
        assert_eq!(
            MessageKind::PunchRequest.reply(),
            Some(MessageKind::PunchReply)
        );
    }

    #[test]
    fn test_punch_request_defaults() {
        let msg = PunchMessage::decode(br#"{"type":"PUNCH_REQUEST","target":"10.0.0.1:6881"}"#)
            .unwrap();
        assert_eq!(
            msg,
            PunchMessage::PunchRequest {
                target: "10.0.0.1:6881".parse().unwrap(),
                client_data: None,
                message_only: false,
            }
        );
    }

    #[test]
    fn test_legacy_debug_payload_ignored() {
        let msg = PunchMessage::decode(
            br#"{"type":"BIND_REPLY","ok":true,"port":40001,"_debug":{"s":"AAAA","m":"x"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            PunchMessage::BindReply {
                ok: true,
                port: Some(40001)
            }
        );
    }

    #[test]
    fn test_connect_request_origin_is_hex() {
        let msg = PunchMessage::ConnectRequest {
            origin: vec![0xde, 0xad, 0xbe, 0xef],
            port: 6881,
            client_data: None,
            message_only: true,
        };
        let bytes = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["origin"], json!("deadbeef"));
        assert_eq!(PunchMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = PunchMessage::decode(br#"{"type":"SHUTDOWN"}"#).unwrap_err();
        assert!(matches!(err, PunchError::Decode(_)));
        assert!(PunchMessage::decode(b"not json").is_err());
    }

    #[test]
    fn test_decode_reply_checks_kind() {
        let bytes = PunchMessage::CloseReply { ok: true }.encode().unwrap();
        assert!(PunchMessage::decode_reply(MessageKind::CloseRequest, &bytes).is_ok());

        let err = PunchMessage::decode_reply(MessageKind::BindRequest, &bytes).unwrap_err();
        assert!(matches!(
            err,
            PunchError::UnexpectedReply {
                expected: MessageKind::BindReply,
                actual: MessageKind::CloseReply
            }
        ));
    }
}
