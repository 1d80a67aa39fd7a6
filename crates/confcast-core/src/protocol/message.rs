//! The message envelope and its JSON wire form.
//!
//! Wire format: `{"message_type":0,"message_content":{..}|null,"to":"..."|null,"from":"..."}`
//!
//! `from` is always stamped by [`Envelope::encode`]; whatever the caller put
//! there is ignored.

use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Upper bound for a single encoded envelope. Receive buffers use this size.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Free-form envelope payload.
pub type Content = Map<String, Value>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(u8),
}

/// Message types, in wire ordinal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    HandshakeRequest = 0,
    HandshakeResponse = 1,
    ConfigurationRequest = 2,
    ConfigurationChange = 3,
    ConfigurationBroadcast = 4,
    HeartbeatRequest = 5,
    HeartbeatResponse = 6,
    ConnectionClose = 7,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        MessageType::HandshakeRequest,
        MessageType::HandshakeResponse,
        MessageType::ConfigurationRequest,
        MessageType::ConfigurationChange,
        MessageType::ConfigurationBroadcast,
        MessageType::HeartbeatRequest,
        MessageType::HeartbeatResponse,
        MessageType::ConnectionClose,
    ];

    /// True for the two types that announce a new configuration version.
    pub fn is_configuration_notice(self) -> bool {
        matches!(
            self,
            MessageType::ConfigurationChange | MessageType::ConfigurationBroadcast
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        MessageType::ALL
            .get(n as usize)
            .copied()
            .ok_or(DecodeError::UnknownType(n))
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> u8 {
        kind as u8
    }
}

/// A typed, optionally addressed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: MessageType,
    pub content: Option<Content>,
    /// Recipient name. `None` means every receiver may act on it.
    pub to: Option<NodeId>,
    /// Sender name. Only set on decoded envelopes.
    pub from: Option<NodeId>,
}

#[derive(Serialize)]
struct WireOut<'a> {
    message_type: u8,
    message_content: Option<&'a Content>,
    to: Option<&'a str>,
    from: &'a str,
}

#[derive(Deserialize)]
struct WireIn {
    message_type: u8,
    #[serde(default)]
    message_content: Option<Content>,
    #[serde(default)]
    to: Option<String>,
    from: String,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            content: None,
            to: None,
            from: None,
        }
    }

    /// Envelope with a `{"name": <name>}` payload, as service nodes send.
    pub fn named(kind: MessageType, name: &NodeId) -> Self {
        let mut content = Content::new();
        content.insert("name".into(), Value::String(name.to_string()));
        Self::new(kind).with_content(content)
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn addressed_to(mut self, to: NodeId) -> Self {
        self.to = Some(to);
        self
    }

    /// String field from the content, if present.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.as_ref()?.get(key)?.as_str()
    }

    /// Whether a node named `me` should act on this envelope.
    ///
    /// False for our own datagrams (multicast loopback) and for envelopes
    /// addressed to someone else.
    pub fn is_addressed_to(&self, me: &NodeId) -> bool {
        if self.from.as_ref() == Some(me) {
            return false;
        }
        match &self.to {
            Some(to) => to == me,
            None => true,
        }
    }

    /// Serialize to JSON bytes with `from` set to `sender`.
    pub fn encode(&self, sender: &NodeId) -> Vec<u8> {
        let wire = WireOut {
            message_type: self.kind.into(),
            message_content: self.content.as_ref(),
            to: self.to.as_ref().map(NodeId::as_str),
            from: sender.as_str(),
        };
        serde_json::to_vec(&wire).expect("Envelope serialization should not fail")
    }

    /// Parse a single datagram.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireIn =
            serde_json::from_slice(data).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let kind = MessageType::try_from(wire.message_type)?;
        let from = NodeId::new(wire.from)
            .map_err(|_| DecodeError::Malformed("empty sender".to_string()))?;
        let to = match wire.to {
            Some(to) => Some(
                NodeId::new(to)
                    .map_err(|_| DecodeError::Malformed("empty recipient".to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            kind,
            content: wire.message_content,
            to,
            from: Some(from),
        })
    }
}
