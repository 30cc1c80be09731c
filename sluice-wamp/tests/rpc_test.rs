use std::time::Duration;

use anyhow::{
    Error,
    Result,
};
use futures_util::future::join_all;
use sluice_wamp::{
    core::{
        error::WampError,
        types::{
            List,
            Value,
        },
        uri::Uri,
    },
    peer::{
        Invocation,
        RegisterOptions,
        RpcCall,
    },
};

mod common;

use common::{
    FakeRouter,
    FakeRouterConfig,
    eventually,
    peer_config,
    start_peer,
};

async fn echo(invocation: Invocation) -> Result<Value> {
    Ok(invocation.arguments.into_iter().next().unwrap_or_default())
}

#[tokio::test]
async fn peer_invokes_procedure_from_another_peer() {
    test_utils::setup::setup_test_environment();

    let (router, transports) = FakeRouter::start(FakeRouterConfig::default());
    let callee = start_peer(peer_config("callee"), &transports).await;
    let caller = start_peer(peer_config("caller"), &transports).await;

    let registration = callee
        .register("com.example.echo", echo, RegisterOptions::default())
        .await
        .unwrap();
    assert_eq!(registration.procedure.as_ref(), "com.example.echo");
    assert_eq!(registration.queue, "default");
    assert_eq!(
        router.registered_procedures(),
        Vec::from_iter([Uri::try_from("com.example.echo").unwrap()])
    );

    assert_matches::assert_matches!(
        caller
            .call(
                "com.example.echo",
                RpcCall::with_arguments([Value::from("something")])
            )
            .await,
        Ok(Value::String(value)) => {
            assert_eq!(value, "something");
        }
    );

    let result = caller
        .call_with_result("com.example.echo", RpcCall::default())
        .await
        .unwrap();
    pretty_assertions::assert_eq!(result.arguments, List::from_iter([Value::Null]));

    callee.shutdown().await.unwrap();
    caller.shutdown().await.unwrap();
}

#[tokio::test]
async fn handler_chooses_error_returned_to_caller() {
    test_utils::setup::setup_test_environment();

    let (_router, transports) = FakeRouter::start(FakeRouterConfig::default());
    let callee = start_peer(peer_config("callee"), &transports).await;
    let caller = start_peer(peer_config("caller"), &transports).await;

    callee
        .register(
            "com.example.lookup",
            |_: Invocation| async move {
                Err::<Value, _>(
                    WampError::invocation(
                        Uri::try_from("com.example.error.not_found").unwrap(),
                        "no such user",
                    )
                    .into(),
                )
            },
            RegisterOptions::default(),
        )
        .await
        .unwrap();
    callee
        .register(
            "com.example.explode",
            |_: Invocation| async move { Err::<Value, _>(Error::msg("boom")) },
            RegisterOptions::default(),
        )
        .await
        .unwrap();

    assert_matches::assert_matches!(
        caller.call("com.example.lookup", RpcCall::default()).await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::Invocation { error, arguments, .. }) => {
                assert_eq!(error.as_ref(), "com.example.error.not_found");
                pretty_assertions::assert_eq!(arguments, &List::from_iter([Value::from("no such user")]));
            });
        }
    );

    assert_matches::assert_matches!(
        caller.call("com.example.explode", RpcCall::default()).await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::Invocation { error, arguments, .. }) => {
                assert_eq!(error.as_ref(), "error.invoke.failure");
                pretty_assertions::assert_eq!(arguments, &List::from_iter([Value::from("Call failed: boom")]));
            });
        }
    );

    callee.shutdown().await.unwrap();
    caller.shutdown().await.unwrap();
}

#[tokio::test]
async fn error_uris_use_configured_prefix() {
    test_utils::setup::setup_test_environment();

    let (_router, transports) = FakeRouter::start(FakeRouterConfig::default());
    let mut config = peer_config("callee");
    config.uri_prefix = Some("com.example".to_owned());
    let callee = start_peer(config, &transports).await;
    let caller = start_peer(peer_config("caller"), &transports).await;

    let registration = callee
        .register(
            "explode",
            |_: Invocation| async move { Err::<Value, _>(Error::msg("boom")) },
            RegisterOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(registration.procedure.as_ref(), "com.example.explode");

    assert_matches::assert_matches!(
        caller.call("com.example.explode", RpcCall::default()).await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::Invocation { error, .. }) => {
                assert_eq!(error.as_ref(), "com.example.error.invoke.failure");
            });
        }
    );

    callee.shutdown().await.unwrap();
    caller.shutdown().await.unwrap();
}

#[tokio::test]
async fn calling_missing_procedure_fails() {
    test_utils::setup::setup_test_environment();

    let (_router, transports) = FakeRouter::start(FakeRouterConfig::default());
    let caller = start_peer(peer_config("caller"), &transports).await;

    assert_matches::assert_matches!(
        caller.call("com.example.missing", RpcCall::default()).await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::Invocation { error, .. }) => {
                assert_eq!(error.as_ref(), "wamp.error.no_such_procedure");
            });
        }
    );

    caller.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_calls_resolve_to_their_own_callers() {
    test_utils::setup::setup_test_environment();

    let (_router, transports) = FakeRouter::start(FakeRouterConfig::default());
    let callee = start_peer(peer_config("callee"), &transports).await;
    let caller = start_peer(peer_config("caller"), &transports).await;

    // Later calls finish first, so replies arrive in reverse order.
    callee
        .register(
            "com.example.delayed_echo",
            |invocation: Invocation| async move {
                let n = invocation
                    .arguments
                    .first()
                    .and_then(|value| value.integer())
                    .unwrap_or_default();
                tokio::time::sleep(Duration::from_millis((10 - n as u64) * 30)).await;
                Ok::<_, Error>(Value::Integer(n))
            },
            RegisterOptions::default(),
        )
        .await
        .unwrap();

    let results = join_all((0..10).map(|n| {
        caller.call(
            "com.example.delayed_echo",
            RpcCall::with_arguments([Value::Integer(n)]),
        )
    }))
    .await;
    for (n, result) in results.into_iter().enumerate() {
        assert_matches::assert_matches!(result, Ok(Value::Integer(value)) => {
            assert_eq!(value, n as i64);
        });
    }
    assert_eq!(caller.stats().await.pending_requests, 0);

    callee.shutdown().await.unwrap();
    caller.shutdown().await.unwrap();
}

#[tokio::test]
async fn call_times_out_without_response() {
    test_utils::setup::setup_test_environment();

    let (_router, transports) = FakeRouter::start(FakeRouterConfig::default());
    let callee = start_peer(peer_config("callee"), &transports).await;
    let mut config = peer_config("caller");
    config.timeout = Duration::from_millis(200);
    let caller = start_peer(config, &transports).await;

    callee
        .register(
            "com.example.slow",
            |_: Invocation| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, Error>(Value::Null)
            },
            RegisterOptions::default(),
        )
        .await
        .unwrap();

    assert_matches::assert_matches!(
        caller.call("com.example.slow", RpcCall::default()).await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::NoResponse));
        }
    );
    assert_eq!(caller.stats().await.pending_requests, 0);

    callee.shutdown().await.unwrap();
    caller.shutdown().await.unwrap();
}

#[tokio::test]
async fn unregister_is_idempotent() {
    test_utils::setup::setup_test_environment();

    let (router, transports) = FakeRouter::start(FakeRouterConfig::default());
    let callee = start_peer(peer_config("callee"), &transports).await;

    let registration = callee
        .register("com.example.echo", echo, RegisterOptions::default())
        .await
        .unwrap();
    assert_matches::assert_matches!(callee.unregister(registration.id).await, Ok(()));
    assert_matches::assert_matches!(callee.unregister(registration.id).await, Ok(()));
    assert!(callee.registrations().await.is_empty());
    eventually(|| {
        let router = router.clone();
        async move { router.registered_procedures().is_empty() }
    })
    .await;

    callee.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_registration_fails() {
    test_utils::setup::setup_test_environment();

    let (_router, transports) = FakeRouter::start(FakeRouterConfig::default());
    let first = start_peer(peer_config("first"), &transports).await;
    let second = start_peer(peer_config("second"), &transports).await;

    first
        .register("com.example.echo", echo, RegisterOptions::default())
        .await
        .unwrap();
    assert_matches::assert_matches!(
        second
            .register("com.example.echo", echo, RegisterOptions::default())
            .await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::Invocation { error, .. }) => {
                assert_eq!(error.as_ref(), "wamp.error.procedure_already_exists");
            });
        }
    );
    assert!(second.registrations().await.is_empty());

    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}
