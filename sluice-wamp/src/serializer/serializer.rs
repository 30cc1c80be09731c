use std::fmt::Debug;

use anyhow::Result;

use crate::{
    core::uri::Uri,
    message::message::Message,
};

/// The type of serializer to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SerializerType {
    /// Serializes messages to and from JavaScript Object Notation.
    Json,
    /// Serializes messages to and from the MessagePack format.
    MessagePack,
    /// Serializes messages to and from the Concise Binary Object Representation.
    Cbor,
}

impl SerializerType {
    /// The protocol URI used during WebSocket sub-protocol negotiation.
    pub fn uri(&self) -> Uri {
        match self {
            Self::Json => Uri::from_known("wamp.2.json"),
            Self::MessagePack => Uri::from_known("wamp.2.msgpack"),
            Self::Cbor => Uri::from_known("wamp.2.cbor"),
        }
    }

    /// The serializer identifier used in the raw socket handshake.
    pub fn raw_socket_id(&self) -> u8 {
        match self {
            Self::Json => 1,
            Self::MessagePack => 2,
            Self::Cbor => 3,
        }
    }

    /// Looks up a serializer by its raw socket identifier.
    pub fn from_raw_socket_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Json),
            2 => Some(Self::MessagePack),
            3 => Some(Self::Cbor),
            _ => None,
        }
    }

    /// Whether the serializer produces binary data, as opposed to UTF-8 text.
    pub fn binary(&self) -> bool {
        !matches!(self, Self::Json)
    }
}

impl TryFrom<&str> for SerializerType {
    type Error = &'static str;
    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "wamp.2.json" | "json" => Ok(Self::Json),
            "wamp.2.msgpack" | "msgpack" => Ok(Self::MessagePack),
            "wamp.2.cbor" | "cbor" => Ok(Self::Cbor),
            _ => Err("unsupported serializer"),
        }
    }
}

/// A serializer, which serializes and deserializes WAMP messages to a well-known format that can be
/// passed over wire.
///
/// Does not implement message batching.
pub trait Serializer: Send + Sync + Debug {
    /// The type of the serializer.
    fn serializer_type(&self) -> SerializerType;

    /// Serializes the given message to bytes.
    fn serialize(&self, value: &Message) -> Result<Vec<u8>>;

    /// Deserializes bytes to a message.
    fn deserialize(&self, bytes: &[u8]) -> Result<Message>;
}
