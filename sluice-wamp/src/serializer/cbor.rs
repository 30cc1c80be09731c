use anyhow::{
    Error,
    Result,
};

use serde::Serialize;

use crate::{
    message::message::Message,
    serializer::serializer::{
        Serializer,
        SerializerType,
    },
};

/// A serializer implemented for the Concise Binary Object Representation.
#[derive(Debug, Default)]
pub struct CborSerializer {}

impl Serializer for CborSerializer {
    fn serializer_type(&self) -> SerializerType {
        SerializerType::Cbor
    }

    fn serialize(&self, value: &Message) -> Result<Vec<u8>> {
        // Message records are written as sequences of unknown length. Going through a value tree
        // first gives every array a known length, so the encoding uses definite-length arrays.
        let value = serde_json::to_value(value)?;
        let mut bytes = Vec::new();
        let mut serializer = minicbor_serde::Serializer::new(&mut bytes);
        serializer.serialize_unit_as_null(true);
        value
            .serialize(&mut serializer)
            .map_err(|err| Error::msg(format!("cbor encode: {err}")))?;
        Ok(bytes)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        minicbor_serde::from_slice(bytes).map_err(|err| Error::msg(format!("cbor decode: {err}")))
    }
}
