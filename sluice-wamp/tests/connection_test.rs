use std::{
    sync::{
        Arc,
        atomic::{
            AtomicUsize,
            Ordering,
        },
    },
    time::Duration,
};

use anyhow::Result;
use sluice_wamp::{
    core::{
        error::{
            ErrorCategory,
            WampError,
        },
        types::Value,
    },
    peer::{
        Invocation,
        Peer,
        PeerConfig,
        RegisterOptions,
        RpcCall,
        SessionState,
    },
    serializer::{
        registry::SerializerRegistry,
        serializer::SerializerType,
    },
    transport::{
        connector::{
            Connection,
            Connector,
            TransportRegistry,
        },
        direct_transport::direct_connector,
    },
};

mod common;

use common::{
    FakeRouter,
    FakeRouterConfig,
    create_peer,
    eventually,
    peer_config,
    start_peer,
};

async fn echo(invocation: Invocation) -> Result<Value> {
    Ok(invocation.arguments.into_iter().next().unwrap_or_default())
}

#[tokio::test]
async fn peer_moves_through_session_states() {
    test_utils::setup::setup_test_environment();

    let (router, transports) = FakeRouter::start(FakeRouterConfig::default());
    let peer = create_peer(peer_config("peer"), &transports);
    assert_eq!(peer.state(), SessionState::Disconnected);

    peer.connect().await.unwrap();
    assert_eq!(peer.state(), SessionState::TransportConnected);

    peer.hello().await.unwrap();
    assert_eq!(peer.state(), SessionState::Connected);

    let hellos = router.hellos();
    assert_eq!(hellos.len(), 1);
    assert_eq!(hellos[0].realm.as_ref(), "realm1");
    assert_matches::assert_matches!(hellos[0].details.get("agent"), Some(Value::String(agent)) => {
        assert!(agent.starts_with("sluice-wamp-"), "{agent}");
    });
    assert_matches::assert_matches!(hellos[0].details.get("roles"), Some(Value::Dictionary(roles)) => {
        let mut roles = roles.keys().cloned().collect::<Vec<_>>();
        roles.sort();
        pretty_assertions::assert_eq!(roles, Vec::from_iter(["callee", "caller", "publisher", "subscriber"].map(|role| role.to_owned())));
    });

    peer.disconnect().await.unwrap();
    assert_eq!(peer.state(), SessionState::Disconnected);

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn requests_fail_without_session() {
    test_utils::setup::setup_test_environment();

    let (_router, transports) = FakeRouter::start(FakeRouterConfig::default());
    let peer = create_peer(peer_config("peer"), &transports);

    assert_matches::assert_matches!(peer.hello().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::NotConnected));
    });
    assert_matches::assert_matches!(peer.call("com.example.echo", RpcCall::default()).await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::NotConnected));
    });
    assert_matches::assert_matches!(
        peer.register("com.example.echo", echo, RegisterOptions::default()).await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::NotConnected));
        }
    );

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_welcome_times_out() {
    test_utils::setup::setup_test_environment();

    let (_router, transports) = FakeRouter::start(FakeRouterConfig {
        answer_hello: false,
        ..Default::default()
    });
    let mut config = peer_config("peer");
    config.timeout = Duration::from_millis(200);
    let peer = create_peer(config, &transports);

    assert_matches::assert_matches!(peer.start().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::WelcomeTimeout));
    });
    assert_eq!(peer.state(), SessionState::Disconnected);

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn router_abort_fails_join() {
    test_utils::setup::setup_test_environment();

    let (_router, transports) = FakeRouter::start(FakeRouterConfig {
        abort_reason: Some("wamp.error.no_such_realm".to_owned()),
        ..Default::default()
    });
    let peer = create_peer(peer_config("peer"), &transports);

    assert_matches::assert_matches!(peer.start().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::Abort { reason, message }) => {
            assert_eq!(reason.as_ref(), "wamp.error.no_such_realm");
            assert_eq!(message, "go away");
        });
    });
    assert_eq!(peer.state(), SessionState::Disconnected);

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn connect_gives_up_after_configured_attempts() {
    test_utils::setup::setup_test_environment();

    let (connector, acceptor) = direct_connector(SerializerType::Json);
    drop(acceptor);
    let mut transports = TransportRegistry::empty();
    transports.register("direct", Arc::new(connector));

    let mut config = peer_config("peer");
    config.connect_attempts = Some(2);
    let peer = create_peer(config, &transports);

    assert_matches::assert_matches!(peer.start().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(err) => {
            assert_eq!(err.category(), ErrorCategory::Connection);
        });
    });
    assert_eq!(peer.state(), SessionState::Disconnected);

    peer.shutdown().await.unwrap();
}

struct StalledConnector {
    attempts: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Connector for StalledConnector {
    async fn connect(&self, _: &PeerConfig, _: &str) -> Result<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        futures_util::future::pending::<Result<Connection>>().await
    }
}

#[tokio::test]
async fn second_connect_does_not_replace_attempt_in_progress() {
    test_utils::setup::setup_test_environment();

    let attempts = Arc::new(AtomicUsize::new(0));
    let mut transports = TransportRegistry::empty();
    transports.register(
        "direct",
        Arc::new(StalledConnector {
            attempts: attempts.clone(),
        }),
    );
    let peer = create_peer(peer_config("peer"), &transports);

    let first = tokio::spawn({
        let peer = peer.clone();
        async move { peer.connect().await }
    });
    eventually(|| {
        let peer = peer.clone();
        async move { peer.state() == SessionState::Connecting }
    })
    .await;

    assert_matches::assert_matches!(peer.connect().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::ProtocolViolation(_)));
    });
    assert_eq!(peer.state(), SessionState::Connecting);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    first.abort();
    peer.shutdown().await.unwrap();
    assert_eq!(peer.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn unknown_scheme_is_fatal() {
    test_utils::setup::setup_test_environment();

    let peer = Peer::new(PeerConfig {
        url: "carrier-pigeon://router".to_owned(),
        ..Default::default()
    })
    .unwrap();
    assert_matches::assert_matches!(peer.start().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::Fatal(_)));
    });
    assert_eq!(peer.state(), SessionState::Disconnected);

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    assert_matches::assert_matches!(
        Peer::new(PeerConfig {
            serializers: Vec::new(),
            ..Default::default()
        })
        .err(),
        Some(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::Fatal(_)));
        }
    );
    assert_matches::assert_matches!(
        Peer::with_registries(
            PeerConfig::default(),
            TransportRegistry::default(),
            SerializerRegistry::empty(),
        )
        .err(),
        Some(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::Fatal(_)));
        }
    );
}

#[tokio::test]
async fn oversized_message_fails_only_its_request() {
    test_utils::setup::setup_test_environment();

    let (_router, transports) = FakeRouter::start(FakeRouterConfig::default());
    let callee = start_peer(peer_config("callee"), &transports).await;
    let mut config = peer_config("caller");
    config.max_payload_size = Some(512);
    let caller = start_peer(config, &transports).await;

    callee
        .register("com.example.echo", echo, RegisterOptions::default())
        .await
        .unwrap();

    assert_matches::assert_matches!(
        caller
            .call(
                "com.example.echo",
                RpcCall::with_arguments([Value::String("x".repeat(1024))])
            )
            .await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::MessageOversized { max, .. }) => {
                assert_eq!(*max, 512);
            });
        }
    );
    assert_eq!(caller.state(), SessionState::Connected);
    assert_eq!(caller.stats().await.pending_requests, 0);

    assert_matches::assert_matches!(
        caller
            .call("com.example.echo", RpcCall::with_arguments([Value::from("small")]))
            .await,
        Ok(Value::String(value)) => {
            assert_eq!(value, "small");
        }
    );

    callee.shutdown().await.unwrap();
    caller.shutdown().await.unwrap();
}
