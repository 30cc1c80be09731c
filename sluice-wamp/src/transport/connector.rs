use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    core::{
        error::WampError,
        hash::HashMap,
    },
    peer::config::PeerConfig,
    serializer::serializer::SerializerType,
    transport::{
        raw_socket_transport::RawSocketConnector,
        transport::Transport,
        web_socket_transport::WebSocketConnector,
    },
};

/// A connection to a WAMP router produced by a [`Connector`].
pub struct Connection {
    pub transport: Box<dyn Transport>,
    /// The serializer agreed on with the router.
    pub serializer: SerializerType,
    /// The largest message the router accepts, if it announced one.
    pub max_message_size: Option<usize>,
}

/// A type for initiating a connection to a router.
///
/// Errors that can never succeed on retry, such as a malformed URL or a failed serializer
/// negotiation, must be reported as [`WampError::Fatal`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &PeerConfig, url: &str) -> Result<Connection>;
}

/// Splits a URL into its scheme and the remainder.
pub fn split_scheme(url: &str) -> Result<(&str, &str)> {
    match url.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() => Ok((scheme, rest)),
        _ => Err(WampError::Fatal(format!("malformed URL: {url}")).into()),
    }
}

/// The set of connectors available to a peer, keyed by URL scheme.
#[derive(Clone)]
pub struct TransportRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl TransportRegistry {
    /// Creates a registry with no connectors.
    pub fn empty() -> Self {
        Self {
            connectors: HashMap::default(),
        }
    }

    /// Registers a connector for a URL scheme, replacing any existing one.
    pub fn register<S>(&mut self, scheme: S, connector: Arc<dyn Connector>)
    where
        S: Into<String>,
    {
        self.connectors.insert(scheme.into(), connector);
    }

    /// Looks up the connector for the URL's scheme.
    pub fn connector_for(&self, url: &str) -> Result<Arc<dyn Connector>> {
        let (scheme, _) = split_scheme(url)?;
        self.connectors
            .get(&scheme.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| WampError::Fatal(format!("unsupported URL scheme: {scheme}")).into())
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        let web_socket: Arc<dyn Connector> = Arc::new(WebSocketConnector::default());
        registry.register("ws", web_socket.clone());
        registry.register("wss", web_socket);
        let tcp: Arc<dyn Connector> = Arc::new(RawSocketConnector::tcp());
        registry.register("tcpip", tcp.clone());
        registry.register("tcp", tcp);
        #[cfg(unix)]
        registry.register("unix", Arc::new(RawSocketConnector::unix()));
        registry
    }
}

#[cfg(test)]
mod connector_test {
    use crate::{
        core::error::WampError,
        transport::connector::{
            TransportRegistry,
            split_scheme,
        },
    };

    #[test]
    fn splits_schemes() {
        assert_matches::assert_matches!(split_scheme("ws://localhost:8080"), Ok(("ws", "localhost:8080")));
        assert_matches::assert_matches!(split_scheme("unix:///tmp/wamp.sock"), Ok(("unix", "/tmp/wamp.sock")));
        assert_matches::assert_matches!(split_scheme("localhost:8080"), Err(_));
    }

    #[test]
    fn unknown_scheme_is_fatal() {
        let registry = TransportRegistry::default();
        assert!(registry.connector_for("ws://localhost:8080").is_ok());
        assert!(registry.connector_for("WSS://localhost").is_ok());
        assert!(registry.connector_for("tcpip://localhost:9000").is_ok());
        assert_matches::assert_matches!(registry.connector_for("http://localhost").err(), Some(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::Fatal(_)));
        });
        assert_matches::assert_matches!(registry.connector_for("nonsense").err(), Some(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::Fatal(_)));
        });
    }
}
