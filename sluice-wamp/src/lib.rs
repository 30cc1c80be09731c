pub mod auth;
pub mod core;
pub mod message;
pub mod peer;
pub mod queue;
pub mod serializer;
pub mod transport;
