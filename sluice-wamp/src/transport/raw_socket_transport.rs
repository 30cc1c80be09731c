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
use futures_util::{
    Sink,
    SinkExt,
    Stream,
    StreamExt,
    sink,
    stream,
};
use log::debug;
use tokio::io::{
    AsyncRead,
    AsyncReadExt,
    AsyncWrite,
    AsyncWriteExt,
};

use crate::{
    core::error::WampError,
    peer::config::PeerConfig,
    serializer::serializer::SerializerType,
    transport::{
        connector::{
            Connection,
            Connector,
            split_scheme,
        },
        transport::{
            Transport,
            TransportData,
        },
    },
};

const MAGIC: u8 = 0x7F;
const MAX_LENGTH_EXPONENT: u8 = 15;
const MAX_FRAME_LENGTH: usize = (1 << 24) - 1;

const FRAME_MESSAGE: u8 = 0;
const FRAME_PING: u8 = 1;
const FRAME_PONG: u8 = 2;

/// The maximum message length announced by a length exponent in the handshake.
pub fn max_length_for_exponent(exponent: u8) -> usize {
    1 << (9 + exponent.min(MAX_LENGTH_EXPONENT) as usize)
}

/// The smallest length exponent that admits messages of the given size.
pub fn exponent_for_max_length(max_length: Option<usize>) -> u8 {
    match max_length {
        Some(max_length) => (0..MAX_LENGTH_EXPONENT)
            .find(|exponent| max_length_for_exponent(*exponent) >= max_length)
            .unwrap_or(MAX_LENGTH_EXPONENT),
        None => MAX_LENGTH_EXPONENT,
    }
}

fn describe_handshake_error(code: u8) -> &'static str {
    match code {
        0 => "illegal (must not be used)",
        1 => "serializer unsupported",
        2 => "maximum message length unacceptable",
        3 => "use of reserved bits (unsupported feature)",
        4 => "maximum connection count reached",
        _ => "unknown error",
    }
}

/// Performs the client side of the raw socket handshake.
///
/// Returns the maximum message length the router accepts.
pub async fn handshake<S>(stream: &mut S, serializer: SerializerType, exponent: u8) -> Result<usize>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exponent = exponent.min(MAX_LENGTH_EXPONENT);
    let request = [MAGIC, (exponent << 4) | serializer.raw_socket_id(), 0, 0];
    stream
        .write_all(&request)
        .await
        .map_err(|err| WampError::Connection(format!("failed to send handshake: {err}")))?;
    stream
        .flush()
        .await
        .map_err(|err| WampError::Connection(format!("failed to send handshake: {err}")))?;

    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|err| WampError::Connection(format!("failed to read handshake: {err}")))?;
    if reply[0] != MAGIC {
        return Err(WampError::Fatal(format!(
            "router replied to handshake with invalid magic octet {:#04x}",
            reply[0]
        ))
        .into());
    }
    let upper = reply[1] >> 4;
    let lower = reply[1] & 0x0F;
    if lower == 0 {
        return Err(WampError::Fatal(format!(
            "router rejected handshake: {}",
            describe_handshake_error(upper)
        ))
        .into());
    }
    if lower != serializer.raw_socket_id() {
        return Err(WampError::Fatal(format!(
            "router selected serializer {lower}, but {} was requested",
            serializer.raw_socket_id()
        ))
        .into());
    }
    Ok(max_length_for_exponent(upper))
}

async fn read_frame<R>(reader: &mut R, max_length: usize) -> Result<Option<TransportData>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => (),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(WampError::Connection(err.to_string()).into()),
    }
    if header[0] & 0xF8 != 0 {
        return Err(WampError::ProtocolViolation(format!(
            "frame header uses reserved bits: {:#04x}",
            header[0]
        ))
        .into());
    }
    let length = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
    if length > max_length {
        return Err(WampError::ProtocolViolation(format!(
            "received frame of {length} bytes, which exceeds {max_length} bytes"
        ))
        .into());
    }
    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| WampError::Connection(err.to_string()))?;
    match header[0] & 0x07 {
        FRAME_MESSAGE => Ok(Some(TransportData::Message(payload))),
        FRAME_PING => Ok(Some(TransportData::Ping(payload))),
        FRAME_PONG => Ok(Some(TransportData::Pong(payload))),
        kind => Err(WampError::ProtocolViolation(format!("unknown frame type {kind}")).into()),
    }
}

async fn write_frame<W>(writer: &mut W, data: TransportData) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (kind, payload) = match data {
        TransportData::Message(payload) => (FRAME_MESSAGE, payload),
        TransportData::Ping(payload) => (FRAME_PING, payload),
        TransportData::Pong(payload) => (FRAME_PONG, payload),
    };
    if payload.len() > MAX_FRAME_LENGTH {
        return Err(WampError::MessageOversized {
            size: payload.len(),
            max: MAX_FRAME_LENGTH,
        }
        .into());
    }
    let length = (payload.len() as u32).to_be_bytes();
    let header = [kind, length[1], length[2], length[3]];
    let io = async {
        writer.write_all(&header).await?;
        writer.write_all(&payload).await?;
        writer.flush().await
    };
    io.await
        .map_err(|err| WampError::Connection(err.to_string()).into())
}

type FrameStream = Pin<Box<dyn Stream<Item = Result<TransportData>> + Send>>;
type FrameSink = Pin<Box<dyn Sink<TransportData, Error = Error> + Send>>;

/// A transport over a byte stream using the WAMP raw socket framing.
///
/// Each frame is a 4-byte header (frame type in the low 3 bits of the first octet and a 24-bit
/// big-endian length) followed by the payload.
pub struct RawSocketTransport {
    stream: FrameStream,
    sink: FrameSink,
}

impl RawSocketTransport {
    /// Creates a transport over an established stream, after the handshake has completed.
    ///
    /// `max_receive_length` bounds the frames accepted from the other side.
    pub fn new<S>(io: S, max_receive_length: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let stream = stream::unfold(Some(reader), move |reader| async move {
            let mut reader = reader?;
            match read_frame(&mut reader, max_receive_length).await {
                Ok(Some(data)) => Some((Ok(data), Some(reader))),
                Ok(None) => None,
                // Nothing after a broken frame can be trusted.
                Err(err) => Some((Err(err), None)),
            }
        });
        let sink = sink::unfold(writer, |mut writer, data: TransportData| async move {
            write_frame(&mut writer, data).await?;
            Ok::<_, Error>(writer)
        });
        Self {
            stream: Box::pin(stream),
            sink: Box::pin(sink),
        }
    }
}

impl Debug for RawSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSocketTransport").finish_non_exhaustive()
    }
}

impl Transport for RawSocketTransport {}

impl Stream for RawSocketTransport {
    type Item = Result<TransportData>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

impl Sink<TransportData> for RawSocketTransport {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.sink.poll_ready_unpin(cx)
    }

    fn start_send(
        mut self: Pin<&mut Self>,
        item: TransportData,
    ) -> std::result::Result<(), Self::Error> {
        self.sink.start_send_unpin(item)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.sink.poll_flush_unpin(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.sink.poll_close_unpin(cx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    Tcp,
    #[cfg(unix)]
    Unix,
}

/// A [`Connector`] for raw socket URLs.
///
/// TCP connectors accept `tcpip://host:port` URLs. Unix connectors accept `unix:///path/to/socket`
/// URLs. The first configured serializer is requested in the handshake.
#[derive(Debug)]
pub struct RawSocketConnector {
    kind: SocketKind,
}

impl RawSocketConnector {
    pub fn tcp() -> Self {
        Self {
            kind: SocketKind::Tcp,
        }
    }

    #[cfg(unix)]
    pub fn unix() -> Self {
        Self {
            kind: SocketKind::Unix,
        }
    }

    async fn establish<S>(
        &self,
        config: &PeerConfig,
        url: &str,
        mut io: S,
    ) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let serializer = config
            .serializers
            .first()
            .cloned()
            .ok_or_else(|| WampError::Fatal("no serializers configured".to_owned()))?;
        let exponent = exponent_for_max_length(config.max_payload_size);
        let max_message_size = handshake(&mut io, serializer, exponent).await?;
        debug!(
            "Raw socket connection to {url} negotiated {} with maximum message length {max_message_size}",
            serializer.uri()
        );
        Ok(Connection {
            transport: Box::new(RawSocketTransport::new(
                io,
                max_length_for_exponent(exponent),
            )),
            serializer,
            max_message_size: Some(max_message_size),
        })
    }
}

#[async_trait]
impl Connector for RawSocketConnector {
    async fn connect(&self, config: &PeerConfig, url: &str) -> Result<Connection> {
        let (_, address) = split_scheme(url)?;
        match self.kind {
            SocketKind::Tcp => {
                let address = address.trim_end_matches('/');
                let stream = tokio::net::TcpStream::connect(address).await.map_err(|err| {
                    WampError::Connection(format!("failed to connect to {url}: {err}"))
                })?;
                stream.set_nodelay(true).ok();
                self.establish(config, url, stream).await
            }
            #[cfg(unix)]
            SocketKind::Unix => {
                let stream = tokio::net::UnixStream::connect(address).await.map_err(|err| {
                    WampError::Connection(format!("failed to connect to {url}: {err}"))
                })?;
                self.establish(config, url, stream).await
            }
        }
    }
}
