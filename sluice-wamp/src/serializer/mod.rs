pub mod cbor;
pub mod json;
pub mod message_pack;
pub mod registry;
pub mod serializer;
