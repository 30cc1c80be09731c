use std::str;
use std::{
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use futures_util::{
    Sink,
    SinkExt,
    Stream,
    StreamExt,
};
use log::debug;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector as TlsConnector,
    MaybeTlsStream,
    WebSocketStream,
    connect_async_tls_with_config,
    tungstenite::{
        ClientRequestBuilder,
        Message,
        http::{
            Uri as HttpUri,
            header::SEC_WEBSOCKET_PROTOCOL,
        },
    },
};

use crate::{
    core::error::WampError,
    peer::config::PeerConfig,
    serializer::serializer::SerializerType,
    transport::{
        connector::{
            Connection,
            Connector,
        },
        transport::{
            Transport,
            TransportData,
        },
    },
};

/// A transport implemented for a TCP stream using the WebSocket protocol.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    binary: bool,
}

impl WebSocketTransport {
    pub fn new(
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        serializer_type: SerializerType,
    ) -> Self {
        Self {
            stream,
            binary: serializer_type.binary(),
        }
    }
}

impl Transport for WebSocketTransport {}

impl Stream for WebSocketTransport {
    type Item = Result<TransportData>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        match futures_util::ready!(self.stream.poll_next_unpin(cx)) {
            Some(Ok(message)) => {
                if message.is_ping() {
                    task::Poll::Ready(Some(Ok(TransportData::Ping(message.into_data().to_vec()))))
                } else if message.is_pong() {
                    task::Poll::Ready(Some(Ok(TransportData::Pong(message.into_data().to_vec()))))
                } else if message.is_text() || message.is_binary() {
                    if message.is_text() && self.binary {
                        task::Poll::Ready(Some(Err(Error::msg("expected binary"))))
                    } else if message.is_binary() && !self.binary {
                        task::Poll::Ready(Some(Err(Error::msg("expected text"))))
                    } else {
                        task::Poll::Ready(Some(Ok(TransportData::Message(
                            message.into_data().to_vec(),
                        ))))
                    }
                } else if message.is_close() {
                    task::Poll::Ready(None)
                } else {
                    task::Poll::Ready(Some(Err(Error::msg("unexpected websocket message"))))
                }
            }
            Some(Err(err)) => task::Poll::Ready(Some(Err(
                WampError::Connection(err.to_string()).into()
            ))),
            None => task::Poll::Ready(None),
        }
    }
}

impl Sink<TransportData> for WebSocketTransport {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.stream.poll_ready_unpin(cx).map_err(Error::new)
    }

    fn start_send(
        mut self: Pin<&mut Self>,
        item: TransportData,
    ) -> std::result::Result<(), Self::Error> {
        let message = match item {
            TransportData::Ping(data) => Message::Ping(data.into()),
            TransportData::Pong(data) => Message::Pong(data.into()),
            TransportData::Message(data) => {
                if self.binary {
                    Message::Binary(data.into())
                } else {
                    Message::Text(str::from_utf8(&data)?.to_owned().into())
                }
            }
        };
        self.stream.start_send_unpin(message).map_err(Error::new)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.stream.poll_flush_unpin(cx).map_err(Error::new)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.stream.poll_close_unpin(cx).map_err(Error::new)
    }
}

/// A [`Connector`] for `ws://` and `wss://` URLs.
///
/// Offers every configured serializer as a WebSocket sub-protocol and uses the one the router
/// selects.
#[derive(Default)]
pub struct WebSocketConnector {}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, config: &PeerConfig, url: &str) -> Result<Connection> {
        let uri = HttpUri::try_from(url)
            .map_err(|err| WampError::Fatal(format!("malformed URL {url}: {err}")))?;
        let mut request = ClientRequestBuilder::new(uri);
        if !config.agent.is_empty() {
            request = request.with_header("User-Agent", &config.agent);
        }
        for serializer in &config.serializers {
            request = request.with_sub_protocol(serializer.uri().to_string());
        }
        for (key, value) in &config.web_socket.headers {
            request = request.with_header(key, value);
        }

        let connector = config
            .tls
            .as_ref()
            .map(|tls| TlsConnector::Rustls(tls.clone()));
        let (stream, response) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|err| WampError::Connection(format!("failed to connect to {url}: {err}")))?;

        let serializer = match response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            Some(protocol) => {
                let protocol = protocol
                    .to_str()
                    .map_err(|err| WampError::Fatal(err.to_string()))?;
                SerializerType::try_from(protocol).map_err(|err| {
                    WampError::Fatal(format!("router selected {protocol}: {err}"))
                })?
            }
            None => {
                return Err(WampError::Fatal(
                    "handshake did not produce a sub-protocol".to_owned(),
                )
                .into());
            }
        };
        if !config.serializers.contains(&serializer) {
            return Err(WampError::Fatal(format!(
                "router selected serializer {} that was not offered",
                serializer.uri()
            ))
            .into());
        }
        debug!("WebSocket connection to {url} negotiated {}", serializer.uri());

        Ok(Connection {
            transport: Box::new(WebSocketTransport::new(stream, serializer)),
            serializer,
            max_message_size: None,
        })
    }
}
