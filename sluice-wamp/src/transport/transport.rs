use std::fmt::Debug;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    Stream,
};

/// Data sent or received over a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportData {
    /// A health check. Received pings are answered with a [`TransportData::Pong`] carrying the
    /// same payload.
    Ping(Vec<u8>),
    /// The answer to a health check.
    Pong(Vec<u8>),
    /// Data representing a meaningful WAMP message.
    Message(Vec<u8>),
}

/// A transport, over which WAMP messages can be sent and received.
///
/// Implemented as a [`Stream`] and [`Sink`] that extracts out meaningful data and reports protocol
/// violations to be handled at higher layers. The stream ending means the connection is closed.
///
/// Unrecoverable I/O failures should be reported as
/// [`WampError::Connection`][crate::core::error::WampError::Connection].
pub trait Transport:
    Send + Stream<Item = Result<TransportData>> + Sink<TransportData, Error = Error> + Unpin + Debug
{
}
