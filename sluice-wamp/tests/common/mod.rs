#![allow(dead_code)]

use std::{
    future::Future,
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    time::Duration,
};

use futures_util::{
    SinkExt,
    StreamExt,
};
use sluice_wamp::{
    core::{
        hash::HashMap,
        id::Id,
        stream::{
            MessageStream,
            StreamMessage,
        },
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::{
        common::{
            abort_message_for_error,
            goodbye_and_out,
        },
        message::{
            ChallengeMessage,
            ErrorMessage,
            EventMessage,
            GoodbyeMessage,
            HelloMessage,
            InvocationMessage,
            Message,
            MessageKind,
            PublishedMessage,
            RegisteredMessage,
            ResultMessage,
            SubscribedMessage,
            UnregisteredMessage,
            UnsubscribedMessage,
            WelcomeMessage,
        },
    },
    peer::{
        Peer,
        PeerConfig,
        ReconnectPolicy,
    },
    serializer::{
        json::JsonSerializer,
        registry::SerializerRegistry,
        serializer::SerializerType,
    },
    transport::{
        connector::TransportRegistry,
        direct_transport::{
            DirectAcceptor,
            DirectTransport,
            direct_connector,
        },
    },
};
use tokio::sync::{
    broadcast,
    mpsc::{
        UnboundedSender,
        unbounded_channel,
    },
};

pub const ROUTER_URL: &str = "direct://router";

/// Behavior of a [`FakeRouter`].
#[derive(Debug, Clone)]
pub struct FakeRouterConfig {
    /// Requires ticket authentication with the given ID and ticket.
    pub ticket: Option<(String, String)>,
    /// Rejects every HELLO with the given reason.
    pub abort_reason: Option<String>,
    /// Answers HELLO at all.
    pub answer_hello: bool,
}

impl Default for FakeRouterConfig {
    fn default() -> Self {
        Self {
            ticket: None,
            abort_reason: None,
            answer_hello: true,
        }
    }
}

#[derive(Default)]
struct RouterState {
    next_id: u64,
    next_connection: u64,
    connections: HashMap<u64, UnboundedSender<Message>>,
    procedures: HashMap<Uri, (u64, Id)>,
    registrations: HashMap<Id, (u64, Uri)>,
    subscriptions: HashMap<Id, (u64, Uri)>,
    // Invocation request ID to the connection and request ID of the caller.
    calls: HashMap<Id, (u64, Id)>,
    hellos: Vec<HelloMessage>,
    signatures: Vec<String>,
    goodbyes: Vec<Uri>,
    accepted: usize,
}

impl RouterState {
    fn generate_id(&mut self) -> Id {
        self.next_id += 1;
        Id::try_from(self.next_id).unwrap()
    }

    fn send(&self, connection: u64, message: Message) {
        if let Some(tx) = self.connections.get(&connection) {
            tx.send(message).ok();
        }
    }

    fn forget_connection(&mut self, connection: u64) {
        self.connections.remove(&connection);
        self.procedures.retain(|_, (owner, _)| *owner != connection);
        self.registrations.retain(|_, (owner, _)| *owner != connection);
        self.subscriptions.retain(|_, (owner, _)| *owner != connection);
    }
}

fn error_reply(request_type: MessageKind, request: Id, error: &str) -> Message {
    Message::Error(ErrorMessage {
        request_type: request_type.code(),
        request,
        details: Dictionary::default(),
        error: Uri::try_from(error).unwrap(),
        arguments: List::default(),
        arguments_keyword: Dictionary::default(),
    })
}

fn welcome(session: Id, auth_method: &str) -> Message {
    Message::Welcome(WelcomeMessage {
        session,
        details: Dictionary::from_iter([(
            "authmethod".to_owned(),
            Value::from(auth_method),
        )]),
    })
}

/// A minimal in-process router that speaks JSON over direct transports.
///
/// Routes calls between callees and callers, and events between publishers and subscribers.
#[derive(Clone)]
pub struct FakeRouter {
    config: FakeRouterConfig,
    state: Arc<Mutex<RouterState>>,
    answer_pings: Arc<AtomicBool>,
    kill_tx: broadcast::Sender<()>,
}

impl FakeRouter {
    /// Starts a router, returning it along with the transports that connect to it.
    pub fn start(config: FakeRouterConfig) -> (Self, TransportRegistry) {
        let (connector, acceptor) = direct_connector(SerializerType::Json);
        let (kill_tx, _) = broadcast::channel(16);
        let router = Self {
            config,
            state: Arc::new(Mutex::new(RouterState::default())),
            answer_pings: Arc::new(AtomicBool::new(true)),
            kill_tx,
        };
        tokio::spawn(router.clone().accept_loop(acceptor));
        let mut transports = TransportRegistry::empty();
        transports.register("direct", Arc::new(connector));
        (router, transports)
    }

    /// Drops every open connection without saying goodbye.
    pub fn drop_connections(&self) {
        self.kill_tx.send(()).ok();
    }

    /// Closes every session with a GOODBYE.
    pub fn goodbye_all(&self) {
        let state = self.state.lock().unwrap();
        for tx in state.connections.values() {
            tx.send(Message::Goodbye(GoodbyeMessage {
                details: Dictionary::default(),
                reason: Uri::try_from("wamp.close.system_shutdown").unwrap(),
            }))
            .ok();
        }
    }

    pub fn set_answer_pings(&self, answer_pings: bool) {
        self.answer_pings.store(answer_pings, Ordering::SeqCst);
    }

    pub fn hellos(&self) -> Vec<HelloMessage> {
        self.state.lock().unwrap().hellos.clone()
    }

    pub fn signatures(&self) -> Vec<String> {
        self.state.lock().unwrap().signatures.clone()
    }

    pub fn goodbyes(&self) -> Vec<Uri> {
        self.state.lock().unwrap().goodbyes.clone()
    }

    pub fn accepted_connections(&self) -> usize {
        self.state.lock().unwrap().accepted
    }

    pub fn registered_procedures(&self) -> Vec<Uri> {
        self.state.lock().unwrap().procedures.keys().cloned().collect()
    }

    pub fn subscribed_topics(&self) -> Vec<Uri> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .map(|(_, topic)| topic.clone())
            .collect()
    }

    async fn accept_loop(self, mut acceptor: DirectAcceptor) {
        while let Some(transport) = acceptor.accept().await {
            tokio::spawn(self.clone().serve(transport));
        }
    }

    async fn serve(self, transport: DirectTransport) {
        let mut stream = MessageStream::new(
            Box::new(transport),
            Box::new(JsonSerializer::default()),
            None,
        );
        let (tx, mut rx) = unbounded_channel();
        let connection = {
            let mut state = self.state.lock().unwrap();
            state.next_connection += 1;
            state.accepted += 1;
            let connection = state.next_connection;
            state.connections.insert(connection, tx);
            connection
        };
        let mut kill_rx = self.kill_tx.subscribe();
        loop {
            tokio::select! {
                received = stream.next() => match received {
                    Some(Ok(StreamMessage::Message(message))) => {
                        if !self.handle(connection, message) {
                            break;
                        }
                    }
                    Some(Ok(StreamMessage::Ping(data))) => {
                        if self.answer_pings.load(Ordering::SeqCst) {
                            if stream.send(StreamMessage::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(StreamMessage::Pong(_))) => (),
                    Some(Err(_)) | None => break,
                },
                outgoing = rx.recv() => match outgoing {
                    Some(message) => {
                        if stream.send(StreamMessage::Message(message)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = kill_rx.recv() => break,
            }
        }
        self.state.lock().unwrap().forget_connection(connection);
        while let Ok(message) = rx.try_recv() {
            stream.send(StreamMessage::Message(message)).await.ok();
        }
        stream.close().await.ok();
    }

    /// Handles a message from a connection. Returns false if the connection should close.
    fn handle(&self, connection: u64, message: Message) -> bool {
        let mut state = self.state.lock().unwrap();
        match message {
            Message::Hello(message) => {
                state.hellos.push(message);
                if let Some(reason) = &self.config.abort_reason {
                    let reason = Uri::try_from(reason.as_str()).unwrap();
                    state.send(connection, abort_message_for_error(reason, "go away"));
                } else if self.config.ticket.is_some() {
                    state.send(
                        connection,
                        Message::Challenge(ChallengeMessage {
                            auth_method: "ticket".to_owned(),
                            extra: Dictionary::default(),
                        }),
                    );
                } else if self.config.answer_hello {
                    let session = state.generate_id();
                    state.send(connection, welcome(session, "anonymous"));
                }
            }
            Message::Authenticate(message) => {
                let signature = message.signature.into_inner();
                state.signatures.push(signature.clone());
                match &self.config.ticket {
                    Some((_, ticket)) if *ticket == signature => {
                        let session = state.generate_id();
                        state.send(connection, welcome(session, "ticket"));
                    }
                    _ => {
                        state.send(
                            connection,
                            abort_message_for_error(
                                Uri::try_from("wamp.error.authentication_failed").unwrap(),
                                "invalid ticket",
                            ),
                        );
                    }
                }
            }
            Message::Abort(_) => return false,
            Message::Goodbye(message) => {
                state.goodbyes.push(message.reason.clone());
                if message.reason.as_ref() != "wamp.close.goodbye_and_out" {
                    state.send(connection, goodbye_and_out());
                }
                state.forget_connection(connection);
                return false;
            }
            Message::Register(message) => {
                if state.procedures.contains_key(&message.procedure) {
                    state.send(
                        connection,
                        error_reply(
                            MessageKind::Register,
                            message.request,
                            "wamp.error.procedure_already_exists",
                        ),
                    );
                } else {
                    let registration = state.generate_id();
                    state
                        .procedures
                        .insert(message.procedure.clone(), (connection, registration));
                    state
                        .registrations
                        .insert(registration, (connection, message.procedure));
                    state.send(
                        connection,
                        Message::Registered(RegisteredMessage {
                            request: message.request,
                            registration,
                        }),
                    );
                }
            }
            Message::Unregister(message) => match state.registrations.remove(&message.registration)
            {
                Some((_, procedure)) => {
                    state.procedures.remove(&procedure);
                    state.send(
                        connection,
                        Message::Unregistered(UnregisteredMessage {
                            request: message.request,
                        }),
                    );
                }
                None => state.send(
                    connection,
                    error_reply(
                        MessageKind::Unregister,
                        message.request,
                        "wamp.error.no_such_registration",
                    ),
                ),
            },
            Message::Call(message) => match state.procedures.get(&message.procedure).cloned() {
                Some((callee, registration)) => {
                    let request = state.generate_id();
                    state.calls.insert(request, (connection, message.request));
                    state.send(
                        callee,
                        Message::Invocation(InvocationMessage {
                            request,
                            registration,
                            details: Dictionary::default(),
                            arguments: message.arguments,
                            arguments_keyword: message.arguments_keyword,
                        }),
                    );
                }
                None => state.send(
                    connection,
                    error_reply(
                        MessageKind::Call,
                        message.request,
                        "wamp.error.no_such_procedure",
                    ),
                ),
            },
            Message::Yield(message) => {
                if let Some((caller, request)) = state.calls.remove(&message.request) {
                    state.send(
                        caller,
                        Message::Result(ResultMessage {
                            request,
                            details: Dictionary::default(),
                            arguments: message.arguments,
                            arguments_keyword: message.arguments_keyword,
                        }),
                    );
                }
            }
            Message::Error(message) => {
                if let Some((caller, request)) = state.calls.remove(&message.request) {
                    state.send(
                        caller,
                        Message::Error(ErrorMessage {
                            request_type: MessageKind::Call.code(),
                            request,
                            details: Dictionary::default(),
                            error: message.error,
                            arguments: message.arguments,
                            arguments_keyword: message.arguments_keyword,
                        }),
                    );
                }
            }
            Message::Subscribe(message) => {
                let subscription = state.generate_id();
                state
                    .subscriptions
                    .insert(subscription, (connection, message.topic));
                state.send(
                    connection,
                    Message::Subscribed(SubscribedMessage {
                        request: message.request,
                        subscription,
                    }),
                );
            }
            Message::Unsubscribe(message) => {
                match state.subscriptions.remove(&message.subscription) {
                    Some(_) => state.send(
                        connection,
                        Message::Unsubscribed(UnsubscribedMessage {
                            request: message.request,
                        }),
                    ),
                    None => state.send(
                        connection,
                        error_reply(
                            MessageKind::Unsubscribe,
                            message.request,
                            "wamp.error.no_such_subscription",
                        ),
                    ),
                }
            }
            Message::Publish(message) => {
                let publication = state.generate_id();
                let subscribers = state
                    .subscriptions
                    .iter()
                    .filter(|(_, (subscriber, topic))| {
                        *subscriber != connection && *topic == message.topic
                    })
                    .map(|(subscription, (subscriber, _))| (*subscription, *subscriber))
                    .collect::<Vec<_>>();
                for (subscription, subscriber) in subscribers {
                    state.send(
                        subscriber,
                        Message::Event(EventMessage {
                            subscription,
                            publication,
                            details: Dictionary::default(),
                            arguments: message.arguments.clone(),
                            arguments_keyword: message.arguments_keyword.clone(),
                        }),
                    );
                }
                let acknowledge = message
                    .options
                    .get("acknowledge")
                    .and_then(|acknowledge| acknowledge.bool())
                    .unwrap_or(false);
                if acknowledge {
                    state.send(
                        connection,
                        Message::Published(PublishedMessage {
                            request: message.request,
                            publication,
                        }),
                    );
                }
            }
            _ => (),
        }
        true
    }
}

/// Peer configuration suited to a [`FakeRouter`].
pub fn peer_config(name: &str) -> PeerConfig {
    PeerConfig {
        name: name.to_owned(),
        url: ROUTER_URL.to_owned(),
        serializers: Vec::from_iter([SerializerType::Json]),
        timeout: Duration::from_secs(5),
        loop_timeout: Duration::from_millis(50),
        auto_reconnect: ReconnectPolicy::Enabled {
            delay: Duration::from_millis(100),
        },
        ..Default::default()
    }
}

pub fn create_peer(config: PeerConfig, transports: &TransportRegistry) -> Peer {
    Peer::with_registries(config, transports.clone(), SerializerRegistry::default()).unwrap()
}

/// Creates a peer and joins the realm.
pub async fn start_peer(config: PeerConfig, transports: &TransportRegistry) -> Peer {
    let peer = create_peer(config, transports);
    peer.start().await.unwrap();
    peer
}

/// Waits until the condition holds, panicking after a few seconds.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        if tokio::time::Instant::now() > deadline {
            panic!("condition did not hold in time");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
