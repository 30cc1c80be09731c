use std::{
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    SinkExt,
    Stream,
    StreamExt,
};

use crate::{
    core::error::WampError,
    message::message::Message,
    serializer::serializer::Serializer,
    transport::transport::{
        Transport,
        TransportData,
    },
};

/// An item flowing through a [`MessageStream`].
#[derive(Debug)]
pub enum StreamMessage {
    /// Health check from the other side, which should be echoed back as a pong.
    Ping(Vec<u8>),
    /// Answer to a health check.
    Pong(Vec<u8>),
    Message(Message),
}

/// A stream of WAMP messages over a [`Transport`], encoded by a [`Serializer`].
///
/// Frames that fail to decode are reported as [`WampError::MessageCorrupt`] without ending the
/// stream. Outgoing messages larger than the payload maximum fail with
/// [`WampError::MessageOversized`] before reaching the transport.
pub struct MessageStream {
    transport: Box<dyn Transport>,
    serializer: Box<dyn Serializer>,
    max_payload_size: Option<usize>,
}

impl MessageStream {
    pub fn new(
        transport: Box<dyn Transport>,
        serializer: Box<dyn Serializer>,
        max_payload_size: Option<usize>,
    ) -> Self {
        Self {
            transport,
            serializer,
            max_payload_size,
        }
    }
}

impl Stream for MessageStream {
    type Item = Result<StreamMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        match futures_util::ready!(self.transport.poll_next_unpin(cx)) {
            Some(Ok(TransportData::Ping(data))) => {
                task::Poll::Ready(Some(Ok(StreamMessage::Ping(data))))
            }
            Some(Ok(TransportData::Pong(data))) => {
                task::Poll::Ready(Some(Ok(StreamMessage::Pong(data))))
            }
            Some(Ok(TransportData::Message(data))) => match self.serializer.deserialize(&data) {
                Ok(message) => task::Poll::Ready(Some(Ok(StreamMessage::Message(message)))),
                Err(err) => task::Poll::Ready(Some(Err(
                    WampError::MessageCorrupt(err.to_string()).into()
                ))),
            },
            Some(Err(err)) => task::Poll::Ready(Some(Err(err))),
            None => task::Poll::Ready(None),
        }
    }
}

impl Sink<StreamMessage> for MessageStream {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.transport.poll_ready_unpin(cx)
    }

    fn start_send(
        mut self: Pin<&mut Self>,
        item: StreamMessage,
    ) -> std::result::Result<(), Self::Error> {
        let data = match item {
            StreamMessage::Ping(data) => TransportData::Ping(data),
            StreamMessage::Pong(data) => TransportData::Pong(data),
            StreamMessage::Message(message) => {
                let data = self.serializer.serialize(&message)?;
                if let Some(max) = self.max_payload_size {
                    if data.len() > max {
                        return Err(WampError::MessageOversized {
                            size: data.len(),
                            max,
                        }
                        .into());
                    }
                }
                TransportData::Message(data)
            }
        };
        self.transport.start_send_unpin(data)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.transport.poll_flush_unpin(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.transport.poll_close_unpin(cx)
    }
}
