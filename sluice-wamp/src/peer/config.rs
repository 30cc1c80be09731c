use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::Result;

use crate::{
    auth::auth_method::SupportedAuthMethod,
    core::{
        error::WampError,
        hash::HashMap,
        uri::Uri,
    },
    queue::set::{
        ConcurrencyConfig,
        ConcurrencyUpdate,
    },
    serializer::serializer::SerializerType,
};

const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// Configuration for WebSocket-specific WAMP connections.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConfig {
    /// Additional headers to include in the WebSocket handshake request.
    pub headers: HashMap<String, String>,
}

/// How a peer recovers from losing its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Disabled,
    /// Reconnect in the background, waiting `delay` between attempts.
    Enabled { delay: Duration },
}

impl ReconnectPolicy {
    /// The delay between attempts, if reconnection is enabled.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::Enabled { delay } => Some(*delay),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Enabled {
            delay: Duration::from_secs(1),
        }
    }
}

impl From<bool> for ReconnectPolicy {
    fn from(value: bool) -> Self {
        if value {
            Self::default()
        } else {
            Self::Disabled
        }
    }
}

impl From<Duration> for ReconnectPolicy {
    fn from(value: Duration) -> Self {
        Self::Enabled { delay: value }
    }
}

/// Configuration for transport-level health checks.
///
/// Heartbeats only run on sessions that authenticated with something other than anonymous
/// authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings. Zero disables heartbeats.
    pub interval: Duration,
    /// Time a ping may go unanswered before the connection is considered lost.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for a [`Peer`][crate::peer::Peer].
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Name of the peer, mostly for logging.
    pub name: String,
    /// URL of the router.
    ///
    /// The scheme selects the transport: `ws://`, `wss://`, `tcpip://`, `tcp://`, or `unix://`.
    pub url: String,
    /// Realm to join.
    pub realm: String,
    /// Agent name, communicated to the router.
    pub agent: String,
    /// Prefix applied to procedure and topic URIs, as well as error URIs generated by the peer.
    pub uri_prefix: Option<String>,
    /// Authentication ID sent in HELLO.
    ///
    /// If unset, the ID of the first authentication method that carries one is used.
    pub auth_id: Option<String>,
    /// Authentication methods offered to the router.
    pub auth_methods: Vec<SupportedAuthMethod>,
    /// Time to wait for a response to any request, including the WELCOME for HELLO.
    pub timeout: Duration,
    /// Upper bound on a single wait of the read loop, so that heartbeat staleness is checked
    /// regularly.
    ///
    /// Also used as the idle interval of concurrency queue workers.
    pub loop_timeout: Duration,
    pub auto_reconnect: ReconnectPolicy,
    /// Number of attempts [`Peer::connect`][crate::peer::Peer::connect] makes before giving up.
    ///
    /// If unset, connecting is retried until it succeeds when reconnection is enabled, and
    /// attempted once when it is not.
    pub connect_attempts: Option<usize>,
    pub heartbeat: HeartbeatConfig,
    /// Allowed serializers, in order of preference.
    pub serializers: Vec<SerializerType>,
    /// TLS configuration for `wss://` connections. Uses native roots if unset.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Additional configuration for WebSocket-specific connections.
    pub web_socket: WebSocketConfig,
    /// Largest message the peer sends. Raw socket connections also announce it to the router.
    pub max_payload_size: Option<usize>,
    pub concurrency: ConcurrencyConfig,
}

impl PeerConfig {
    /// Checks the configuration for errors that would make every connection attempt fail.
    pub fn validate(&self) -> Result<()> {
        if self.serializers.is_empty() {
            return Err(WampError::Fatal("at least one serializer is required".to_owned()).into());
        }
        if self.auth_methods.is_empty() {
            return Err(
                WampError::Fatal("at least one auth method is required".to_owned()).into(),
            );
        }
        Uri::try_from(self.realm.as_str())
            .map_err(|err| WampError::Fatal(format!("invalid realm: {err}")))?;
        if let Some(prefix) = &self.uri_prefix {
            Uri::try_from(prefix.as_str())
                .map_err(|err| WampError::Fatal(format!("invalid URI prefix: {err}")))?;
        }
        if self.timeout.is_zero() {
            return Err(WampError::Fatal("timeout must be positive".to_owned()).into());
        }
        if self.loop_timeout.is_zero() {
            return Err(WampError::Fatal("loop timeout must be positive".to_owned()).into());
        }
        Ok(())
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_AGENT.to_owned(),
            url: "ws://localhost:8080".to_owned(),
            realm: "realm1".to_owned(),
            agent: DEFAULT_AGENT.to_owned(),
            uri_prefix: None,
            auth_id: None,
            auth_methods: Vec::from_iter([SupportedAuthMethod::Anonymous]),
            timeout: Duration::from_secs(10),
            loop_timeout: Duration::from_secs(5),
            auto_reconnect: ReconnectPolicy::default(),
            connect_attempts: None,
            heartbeat: HeartbeatConfig::default(),
            serializers: Vec::from_iter([
                SerializerType::Json,
                SerializerType::MessagePack,
                SerializerType::Cbor,
            ]),
            tls: None,
            web_socket: WebSocketConfig::default(),
            max_payload_size: None,
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

/// Runtime changes to a running peer.
#[derive(Debug, Default, Clone)]
pub struct ConfigUpdate {
    /// New request timeout.
    pub timeout: Option<Duration>,
    pub concurrency: ConcurrencyUpdate,
}
