use std::{
    fmt::Debug,
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use futures_channel::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
    unbounded,
};
use futures_util::{
    Sink,
    Stream,
    StreamExt,
};
use tokio::sync::mpsc;

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

/// One end of an in-process connection.
///
/// Closing or dropping one end ends the stream on the other.
pub struct DirectTransport {
    tx: UnboundedSender<TransportData>,
    rx: UnboundedReceiver<TransportData>,
}

impl Debug for DirectTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectTransport").finish_non_exhaustive()
    }
}

/// Creates both ends of an in-process connection.
pub fn direct_transport_pair() -> (DirectTransport, DirectTransport) {
    let (a_tx, a_rx) = unbounded();
    let (b_tx, b_rx) = unbounded();
    (
        DirectTransport { tx: a_tx, rx: b_rx },
        DirectTransport { tx: b_tx, rx: a_rx },
    )
}

impl Transport for DirectTransport {}

impl Stream for DirectTransport {
    type Item = Result<TransportData>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx).map(|data| data.map(Ok))
    }
}

impl Sink<TransportData> for DirectTransport {
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: TransportData) -> std::result::Result<(), Self::Error> {
        self.tx
            .unbounded_send(item)
            .map_err(|_| WampError::Connection("direct connection closed".to_owned()).into())
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.tx.close_channel();
        task::Poll::Ready(Ok(()))
    }
}

/// Accepts in-process connections made through a [`DirectConnector`].
pub struct DirectAcceptor {
    connection_rx: mpsc::UnboundedReceiver<DirectTransport>,
}

impl DirectAcceptor {
    /// Waits for the next connection.
    ///
    /// Returns `None` once every connector has been dropped.
    pub async fn accept(&mut self) -> Option<DirectTransport> {
        self.connection_rx.recv().await
    }
}

/// A [`Connector`] that connects to an in-process [`DirectAcceptor`], such as an embedded router.
#[derive(Clone)]
pub struct DirectConnector {
    serializer: SerializerType,
    connection_tx: mpsc::UnboundedSender<DirectTransport>,
}

/// Creates a connector and the acceptor receiving its connections.
///
/// Both sides must agree on the serializer out of band.
pub fn direct_connector(serializer: SerializerType) -> (DirectConnector, DirectAcceptor) {
    let (connection_tx, connection_rx) = mpsc::unbounded_channel();
    (
        DirectConnector {
            serializer,
            connection_tx,
        },
        DirectAcceptor { connection_rx },
    )
}

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self, _: &PeerConfig, _: &str) -> Result<Connection> {
        let (local, remote) = direct_transport_pair();
        self.connection_tx
            .send(remote)
            .map_err(|_| WampError::Connection("no acceptor is listening".to_owned()))?;
        Ok(Connection {
            transport: Box::new(local),
            serializer: self.serializer,
            max_message_size: None,
        })
    }
}
