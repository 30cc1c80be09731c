use anyhow::Result;

use crate::{
    core::{
        error::WampError,
        hash::HashMap,
    },
    serializer::{
        cbor::CborSerializer,
        json::JsonSerializer,
        message_pack::MessagePackSerializer,
        serializer::{
            Serializer,
            SerializerType,
        },
    },
};

/// Constructs a new [`Serializer`].
pub type SerializerConstructor = fn() -> Box<dyn Serializer>;

/// The set of serializers available to a peer, keyed by type.
///
/// Built once and handed to the peer, so codecs can be removed or replaced without global state.
#[derive(Clone)]
pub struct SerializerRegistry {
    constructors: HashMap<SerializerType, SerializerConstructor>,
}

impl SerializerRegistry {
    /// Creates a registry with no serializers.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::default(),
        }
    }

    /// Registers a serializer constructor, replacing any existing one for the same type.
    pub fn register(&mut self, serializer_type: SerializerType, constructor: SerializerConstructor) {
        self.constructors.insert(serializer_type, constructor);
    }

    /// Checks if the serializer type is available.
    pub fn supports(&self, serializer_type: SerializerType) -> bool {
        self.constructors.contains_key(&serializer_type)
    }

    /// Creates a new serializer of the given type.
    pub fn new_serializer(&self, serializer_type: SerializerType) -> Result<Box<dyn Serializer>> {
        match self.constructors.get(&serializer_type) {
            Some(constructor) => Ok(constructor()),
            None => Err(WampError::Fatal(format!(
                "serializer {} is not available",
                serializer_type.uri()
            ))
            .into()),
        }
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(SerializerType::Json, || Box::new(JsonSerializer::default()));
        registry.register(SerializerType::MessagePack, || {
            Box::new(MessagePackSerializer::default())
        });
        registry.register(SerializerType::Cbor, || Box::new(CborSerializer::default()));
        registry
    }
}
