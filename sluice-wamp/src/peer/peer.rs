use std::{
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};

use anyhow::Result;
use futures_util::lock::Mutex;
use log::{
    debug,
    error,
    info,
    trace,
    warn,
};
use tokio::{
    sync::{
        Notify,
        broadcast,
        mpsc::{
            UnboundedReceiver,
            UnboundedSender,
            unbounded_channel,
        },
        watch,
    },
    task::JoinHandle,
    time::Instant,
};

use crate::{
    auth::challenge::{
        hello_auth_details,
        respond_to_challenge,
    },
    core::{
        close::CloseReason,
        error::{
            WampError,
            as_wamp_error,
            is_fatal,
        },
        hash::HashMap,
        id::{
            Id,
            IdAllocator,
            RandomIdAllocator,
        },
        roles::{
            PeerRole,
            roles_dictionary,
        },
        service::{
            Service,
            ServiceEvent,
            ServiceHandle,
            ServiceSender,
        },
        stream::MessageStream,
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
            error_for_invocation,
            goodbye_and_out,
            goodbye_with_close_reason,
        },
        message::{
            CallMessage,
            ErrorMessage,
            EventMessage,
            HelloMessage,
            InvocationMessage,
            Message,
            MessageKind,
            PublishMessage,
            RegisterMessage,
            SubscribeMessage,
            UnregisterMessage,
            UnsubscribeMessage,
            WelcomeMessage,
            YieldMessage,
        },
    },
    peer::{
        config::{
            ConfigUpdate,
            PeerConfig,
        },
        handler::{
            Event,
            EventHandler,
            Invocation,
            ProcedureHandler,
        },
        pending::{
            PendingReply,
            PendingRequests,
        },
        state::SessionState,
    },
    queue::{
        job::{
            Job,
            JobContext,
        },
        queue::ConcurrencyQueue,
        set::{
            DEFAULT_QUEUE,
            QueueSet,
        },
        stats::QueueStats,
    },
    serializer::registry::SerializerRegistry,
    transport::connector::{
        Connection,
        Connector,
        TransportRegistry,
    },
};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// A procedure call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcCall {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

impl RpcCall {
    /// A call with positional arguments only.
    pub fn with_arguments<I>(arguments: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Self {
            arguments: List::from_iter(arguments),
            ..Default::default()
        }
    }
}

/// The result of a procedure call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcResult {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

impl RpcResult {
    /// The first positional argument, or null if there is none.
    pub fn value(self) -> Value {
        self.arguments.into_iter().next().unwrap_or_default()
    }
}

/// An event to publish to a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    /// Wait for the router to confirm the publication.
    ///
    /// On by default.
    pub acknowledge: bool,
}

impl Default for PublishedEvent {
    fn default() -> Self {
        Self {
            arguments: List::default(),
            arguments_keyword: Dictionary::default(),
            acknowledge: true,
        }
    }
}

/// A publication confirmed by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publication {
    pub id: Id,
}

/// A registered procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: Id,
    pub procedure: Uri,
    /// The concurrency queue invocations run on.
    pub queue: String,
}

/// A subscription to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: Id,
    pub topic: Uri,
    /// The concurrency queue events are handled on.
    pub queue: String,
}

/// Options for registering a procedure.
#[derive(Debug, Default, Clone)]
pub struct RegisterOptions {
    /// Concurrency queue for invocations. Uses the default queue if unset.
    pub queue: Option<String>,
    /// Options passed through to the router in REGISTER.
    pub options: Dictionary,
}

/// Options for subscribing to a topic.
#[derive(Debug, Default, Clone)]
pub struct SubscribeOptions {
    /// Concurrency queue for events. Uses the default queue if unset.
    pub queue: Option<String>,
    /// Options passed through to the router in SUBSCRIBE.
    pub options: Dictionary,
}

/// A snapshot of a peer's bookkeeping.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub state: SessionState,
    pub pending_requests: usize,
    pub registrations: usize,
    pub subscriptions: usize,
    /// Reconnection attempts made after losing the connection.
    pub reconnects: u64,
    pub queues: HashMap<String, QueueStats>,
}

#[derive(Clone)]
struct RegistrationEntry {
    procedure: Uri,
    handler: Arc<dyn ProcedureHandler>,
    queue: String,
    options: Dictionary,
}

#[derive(Clone)]
struct SubscriptionEntry {
    topic: Uri,
    handler: Arc<dyn EventHandler>,
    queue: String,
    options: Dictionary,
}

struct Heartbeat {
    handle: JoinHandle<()>,
    awaiting_pong_since: Arc<Mutex<Option<Instant>>>,
}

struct ActiveConnection {
    generation: u64,
    service: ServiceHandle,
    // Taken by the read loop.
    events: Option<UnboundedReceiver<ServiceEvent>>,
    heartbeat: Option<Heartbeat>,
}

enum Dispatched {
    Continue,
    Closed(String),
}

enum ConnectionEnd {
    Lost(String),
    Shutdown,
}

/// A WAMP peer (a.k.a., client) that connects to a WAMP router, joins a realm, and interacts with
/// resources in the realm.
///
/// The peer keeps a single connection at a time. A background read loop dispatches everything the
/// router sends: replies are matched to pending requests by request ID, and invocations and events
/// run on concurrency queues. When the connection is lost, the read loop tears it down and, if
/// enabled, reconnects in the background and restores every registration and subscription.
///
/// Background tasks run until [`Peer::shutdown`] is called.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Creates a new peer using the default transports and serializers.
    pub fn new(config: PeerConfig) -> Result<Self> {
        Self::with_registries(
            config,
            TransportRegistry::default(),
            SerializerRegistry::default(),
        )
    }

    /// Creates a new peer with explicit transports and serializers.
    pub fn with_registries(
        config: PeerConfig,
        transports: TransportRegistry,
        serializers: SerializerRegistry,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(serializer) = config
            .serializers
            .iter()
            .find(|serializer| !serializers.supports(**serializer))
        {
            return Err(WampError::Fatal(format!(
                "serializer {} is not available",
                serializer.uri()
            ))
            .into());
        }
        let (state_tx, _) = watch::channel(SessionState::default());
        let (shutdown_tx, _) = broadcast::channel(1);
        let queues = QueueSet::new(config.concurrency.clone(), config.loop_timeout);
        Ok(Self {
            inner: Arc::new(PeerInner {
                timeout_ms: AtomicU64::new(config.timeout.as_millis() as u64),
                config,
                transports,
                serializers,
                id_allocator: Box::new(RandomIdAllocator::default()),
                state_tx,
                connection: Mutex::new(None),
                join_tx: Mutex::new(None),
                pending: PendingRequests::default(),
                registrations: Mutex::new(HashMap::default()),
                subscriptions: Mutex::new(HashMap::default()),
                queues,
                generation: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                reconnect_lock: Mutex::new(()),
                shut_down: AtomicBool::new(false),
                shutdown_tx,
                restart: Notify::new(),
                read_loop: Mutex::new(None),
            }),
        })
    }

    /// The name of the peer.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The current state of the session.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Receiver for session state changes.
    pub fn state_rx(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Connects to the router and joins the configured realm.
    pub async fn start(&self) -> Result<()> {
        self.inner.connect(false).await?;
        self.inner.hello().await
    }

    /// Establishes the transport connection, without joining a realm.
    ///
    /// Registrations and subscriptions from a previous session are forgotten.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect(false).await
    }

    /// Joins the configured realm over the established transport.
    pub async fn hello(&self) -> Result<()> {
        self.inner.hello().await
    }

    /// Connects and joins again, restoring every registration and subscription.
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.reconnect().await
    }

    /// Leaves the realm and closes the connection.
    ///
    /// Pending requests fail immediately with a connection error. No reconnection is attempted.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.check_not_shut_down()?;
        self.inner.disconnect_connection(None, true).await;
        Ok(())
    }

    /// Shuts the peer down for good.
    ///
    /// Stops the read loop, deactivates every concurrency queue, and disconnects. Calling this
    /// method more than once has no effect.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }

    /// Calls a procedure, returning the first argument of the result.
    pub async fn call(&self, procedure: &str, rpc_call: RpcCall) -> Result<Value> {
        Ok(self.call_with_result(procedure, rpc_call).await?.value())
    }

    /// Calls a procedure, returning the whole result.
    pub async fn call_with_result(&self, procedure: &str, rpc_call: RpcCall) -> Result<RpcResult> {
        let procedure = self.inner.resolve_uri(procedure)?;
        let reply = self
            .inner
            .request(|request| {
                Message::Call(CallMessage {
                    request,
                    options: Dictionary::from_iter([(
                        "disclose_me".to_owned(),
                        Value::Bool(true),
                    )]),
                    procedure,
                    arguments: rpc_call.arguments,
                    arguments_keyword: rpc_call.arguments_keyword,
                })
            })
            .await?;
        match reply {
            Message::Result(message) => Ok(RpcResult {
                arguments: message.arguments,
                arguments_keyword: message.arguments_keyword,
            }),
            Message::Error(message) => Err(WampError::from(&message).into()),
            message => Err(unexpected_reply(MessageKind::Result, &message)),
        }
    }

    /// Registers a procedure.
    ///
    /// Invocations run on the queue named in the options. Under strict naming, the queue must be
    /// configured.
    pub async fn register<H>(
        &self,
        procedure: &str,
        handler: H,
        options: RegisterOptions,
    ) -> Result<Registration>
    where
        H: ProcedureHandler + 'static,
    {
        let procedure = self.inner.resolve_uri(procedure)?;
        let queue = options.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_owned());
        self.inner.queues.validate(&queue).await?;
        let entry = RegistrationEntry {
            procedure,
            handler: Arc::new(handler),
            queue,
            options: options.options,
        };
        let id = self.inner.send_register(&entry).await?;
        let registration = Registration {
            id,
            procedure: entry.procedure.clone(),
            queue: entry.queue.clone(),
        };
        self.inner.registrations.lock().await.insert(id, entry);
        debug!(
            "Peer {} registered {} as {id}",
            self.inner.config.name, registration.procedure
        );
        Ok(registration)
    }

    /// Unregisters a procedure.
    ///
    /// Unregistering an unknown registration succeeds without contacting the router.
    pub async fn unregister(&self, id: Id) -> Result<()> {
        if !self.inner.registrations.lock().await.contains_key(&id) {
            return Ok(());
        }
        if self.state() != SessionState::Connected {
            self.inner.registrations.lock().await.remove(&id);
            return Ok(());
        }
        let reply = self
            .inner
            .request(|request| {
                Message::Unregister(UnregisterMessage {
                    request,
                    registration: id,
                })
            })
            .await?;
        match reply {
            Message::Unregistered(_) => (),
            Message::Error(message)
                if message.error.as_ref() == "wamp.error.no_such_registration" => {}
            Message::Error(message) => return Err(WampError::from(&message).into()),
            message => return Err(unexpected_reply(MessageKind::Unregistered, &message)),
        }
        self.inner.registrations.lock().await.remove(&id);
        Ok(())
    }

    /// Subscribes to a topic.
    ///
    /// Events run on the queue named in the options. Under strict naming, the queue must be
    /// configured.
    pub async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Subscription>
    where
        H: EventHandler + 'static,
    {
        let topic = self.inner.resolve_uri(topic)?;
        let queue = options.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_owned());
        self.inner.queues.validate(&queue).await?;
        let entry = SubscriptionEntry {
            topic,
            handler: Arc::new(handler),
            queue,
            options: options.options,
        };
        let id = self.inner.send_subscribe(&entry).await?;
        let subscription = Subscription {
            id,
            topic: entry.topic.clone(),
            queue: entry.queue.clone(),
        };
        self.inner.subscriptions.lock().await.insert(id, entry);
        debug!(
            "Peer {} subscribed to {} as {id}",
            self.inner.config.name, subscription.topic
        );
        Ok(subscription)
    }

    /// Unsubscribes from a topic.
    ///
    /// Unsubscribing an unknown subscription succeeds without contacting the router.
    pub async fn unsubscribe(&self, id: Id) -> Result<()> {
        if !self.inner.subscriptions.lock().await.contains_key(&id) {
            return Ok(());
        }
        if self.state() != SessionState::Connected {
            self.inner.subscriptions.lock().await.remove(&id);
            return Ok(());
        }
        let reply = self
            .inner
            .request(|request| {
                Message::Unsubscribe(UnsubscribeMessage {
                    request,
                    subscription: id,
                })
            })
            .await?;
        match reply {
            Message::Unsubscribed(_) => (),
            Message::Error(message)
                if message.error.as_ref() == "wamp.error.no_such_subscription" => {}
            Message::Error(message) => return Err(WampError::from(&message).into()),
            message => return Err(unexpected_reply(MessageKind::Unsubscribed, &message)),
        }
        self.inner.subscriptions.lock().await.remove(&id);
        Ok(())
    }

    /// Publishes an event to a topic.
    ///
    /// Returns the publication confirmed by the router if acknowledgement was requested.
    pub async fn publish(&self, topic: &str, event: PublishedEvent) -> Result<Option<Publication>> {
        let topic = self.inner.resolve_uri(topic)?;
        let mut options = Dictionary::default();
        if !event.acknowledge {
            let sender = self.inner.connected_sender().await?;
            sender
                .send(Message::Publish(PublishMessage {
                    request: self.inner.id_allocator.generate_id(),
                    options,
                    topic,
                    arguments: event.arguments,
                    arguments_keyword: event.arguments_keyword,
                }))
                .await?;
            return Ok(None);
        }

        options.insert("acknowledge".to_owned(), Value::Bool(true));
        let reply = self
            .inner
            .request(|request| {
                Message::Publish(PublishMessage {
                    request,
                    options,
                    topic,
                    arguments: event.arguments,
                    arguments_keyword: event.arguments_keyword,
                })
            })
            .await?;
        match reply {
            Message::Published(message) => Ok(Some(Publication {
                id: message.publication,
            })),
            Message::Error(message) => Err(WampError::from(&message).into()),
            message => Err(unexpected_reply(MessageKind::Published, &message)),
        }
    }

    /// Every active registration.
    pub async fn registrations(&self) -> Vec<Registration> {
        self.inner
            .registrations
            .lock()
            .await
            .iter()
            .map(|(id, entry)| Registration {
                id: *id,
                procedure: entry.procedure.clone(),
                queue: entry.queue.clone(),
            })
            .collect()
    }

    /// Every active subscription.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.inner
            .subscriptions
            .lock()
            .await
            .iter()
            .map(|(id, entry)| Subscription {
                id: *id,
                topic: entry.topic.clone(),
                queue: entry.queue.clone(),
            })
            .collect()
    }

    /// Applies runtime configuration changes.
    pub async fn configure(&self, update: ConfigUpdate) -> Result<()> {
        if let Some(timeout) = update.timeout {
            if timeout.is_zero() {
                return Err(WampError::Fatal("timeout must be positive".to_owned()).into());
            }
            self.inner
                .timeout_ms
                .store(timeout.as_millis() as u64, Ordering::SeqCst);
        }
        self.inner.queues.configure(update.concurrency).await
    }

    /// Looks up a concurrency queue by name, creating it if the naming policy allows.
    pub async fn concurrency_queue(&self, name: &str) -> Result<ConcurrencyQueue> {
        if let Some(queue) = self.inner.queues.existing(name).await {
            return Ok(queue);
        }
        self.inner.queues.validate(name).await?;
        Ok(self.inner.queues.queue(name).await)
    }

    /// A snapshot of the peer's bookkeeping.
    pub async fn stats(&self) -> PeerStats {
        PeerStats {
            state: self.state(),
            pending_requests: self.inner.pending.len().await,
            registrations: self.inner.registrations.lock().await.len(),
            subscriptions: self.inner.subscriptions.lock().await.len(),
            reconnects: self.inner.reconnects.load(Ordering::SeqCst),
            queues: self.inner.queues.stats().await,
        }
    }
}

fn unexpected_reply(expected: MessageKind, message: &Message) -> anyhow::Error {
    WampError::ProtocolViolation(format!(
        "expected {expected:?} reply, received {}",
        message.message_name()
    ))
    .into()
}

/// Builds the ERROR reply for a failed invocation.
///
/// Handlers choose the error URI and arguments by failing with [`WampError::Invocation`].
fn invocation_failure(request: Id, failure_uri: &Uri, err: &anyhow::Error) -> Message {
    match as_wamp_error(err) {
        Some(WampError::Invocation {
            error,
            arguments,
            arguments_keyword,
        }) => Message::Error(ErrorMessage {
            request_type: MessageKind::Invocation.code(),
            request,
            details: Dictionary::default(),
            error: error.clone(),
            arguments: arguments.clone(),
            arguments_keyword: arguments_keyword.clone(),
        }),
        _ => error_for_invocation(
            request,
            failure_uri.clone(),
            List::from_iter([Value::String(format!("Call failed: {err:#}"))]),
        ),
    }
}

struct PeerInner {
    config: PeerConfig,
    transports: TransportRegistry,
    serializers: SerializerRegistry,
    id_allocator: Box<dyn IdAllocator>,
    timeout_ms: AtomicU64,

    state_tx: watch::Sender<SessionState>,
    connection: Mutex<Option<ActiveConnection>>,
    // Receives WELCOME, ABORT, and CHALLENGE while joining.
    join_tx: Mutex<Option<UnboundedSender<Message>>>,
    pending: PendingRequests,
    registrations: Mutex<HashMap<Id, RegistrationEntry>>,
    subscriptions: Mutex<HashMap<Id, SubscriptionEntry>>,
    queues: QueueSet,

    generation: AtomicU64,
    reconnects: AtomicU64,
    reconnect_lock: Mutex<()>,
    shut_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    restart: Notify,
    read_loop: Mutex<Option<JoinHandle<()>>>,
}

impl PeerInner {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::SeqCst))
    }

    fn check_not_shut_down(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(WampError::Shutdown.into())
        } else {
            Ok(())
        }
    }

    fn transition_state(&self, next: SessionState) -> Result<()> {
        let mut result = Ok(());
        self.state_tx.send_if_modified(|state| {
            // Only disconnecting twice is harmless. A second connect or join must not replace the
            // one in flight.
            if *state == next && next == SessionState::Disconnected {
                return false;
            }
            if !state.allowed_state_transition(&next) {
                result = Err(WampError::ProtocolViolation(format!(
                    "invalid state transition from {state} to {next}"
                ))
                .into());
                return false;
            }
            trace!(
                "Peer {} transitioned from {state} to {next}",
                self.config.name
            );
            *state = next;
            true
        });
        result
    }

    fn resolve_uri(&self, uri: &str) -> Result<Uri> {
        Uri::with_prefix(self.config.uri_prefix.as_deref(), uri)
            .map_err(|err| WampError::Fatal(err.to_string()).into())
    }

    fn error_uri(&self, uri: &str) -> Uri {
        Uri::with_prefix(self.config.uri_prefix.as_deref(), uri)
            .unwrap_or_else(|_| Uri::from_known(uri))
    }

    async fn ensure_read_loop(self: &Arc<Self>) {
        let mut read_loop = self.read_loop.lock().await;
        if read_loop
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        *read_loop = Some(tokio::spawn(self.clone().read_loop()));
    }

    async fn connect(self: &Arc<Self>, soft_reset: bool) -> Result<()> {
        self.check_not_shut_down()?;
        self.ensure_read_loop().await;
        if self.state().is_active() {
            self.disconnect_connection(None, true).await;
        }
        self.transition_state(SessionState::Connecting)?;
        if let Err(err) = self.establish_connection(soft_reset).await {
            self.transition_state(SessionState::Disconnected).ok();
            return Err(err);
        }
        Ok(())
    }

    async fn establish_connection(self: &Arc<Self>, soft_reset: bool) -> Result<()> {
        let connector = self.transports.connector_for(&self.config.url)?;
        let connection = self.connect_with_retries(connector.as_ref()).await?;
        let serializer_type = connection.serializer;
        let serializer = self.serializers.new_serializer(serializer_type)?;
        let max_payload_size = match (self.config.max_payload_size, connection.max_message_size) {
            (Some(ours), Some(theirs)) => Some(ours.min(theirs)),
            (ours, theirs) => ours.or(theirs),
        };
        let stream = MessageStream::new(connection.transport, serializer, max_payload_size);
        let (service, events) = Service::new(self.config.name.clone(), stream);
        let service = service.start();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.pending.disconnect_all().await;
        if !soft_reset {
            self.registrations.lock().await.clear();
            self.subscriptions.lock().await.clear();
        }
        *self.connection.lock().await = Some(ActiveConnection {
            generation,
            service,
            events: Some(events),
            heartbeat: None,
        });
        if self.shut_down.load(Ordering::SeqCst) {
            self.disconnect_connection(Some(generation), false).await;
            return Err(WampError::Shutdown.into());
        }
        self.transition_state(SessionState::TransportConnected)?;
        info!(
            "Peer {} connected to {} using {}",
            self.config.name,
            self.config.url,
            serializer_type.uri()
        );
        self.restart.notify_one();
        Ok(())
    }

    async fn connect_with_retries(&self, connector: &dyn Connector) -> Result<Connection> {
        let attempts = match (self.config.connect_attempts, self.config.auto_reconnect.delay()) {
            (Some(attempts), _) => Some(attempts.max(1)),
            (None, Some(_)) => None,
            (None, None) => Some(1),
        };
        let delay = self
            .config
            .auto_reconnect
            .delay()
            .unwrap_or(DEFAULT_RETRY_DELAY);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempt = 0;
        loop {
            self.check_not_shut_down()?;
            attempt += 1;
            match connector.connect(&self.config, &self.config.url).await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    if is_fatal(&err) || attempts.is_some_and(|attempts| attempt >= attempts) {
                        return Err(err);
                    }
                    warn!(
                        "Peer {} failed to connect to {} (attempt {attempt}): {err:#}",
                        self.config.name, self.config.url
                    );
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => (),
                _ = shutdown_rx.recv() => return Err(WampError::Shutdown.into()),
            }
        }
    }

    async fn current_connection(&self) -> Result<(u64, ServiceSender)> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|connection| (connection.generation, connection.service.sender()))
            .ok_or_else(|| WampError::NotConnected.into())
    }

    async fn connected_sender(&self) -> Result<ServiceSender> {
        self.check_not_shut_down()?;
        if self.state() != SessionState::Connected {
            return Err(WampError::NotConnected.into());
        }
        Ok(self.current_connection().await?.1)
    }

    fn hello_message(&self) -> Message {
        let mut details =
            hello_auth_details(self.config.auth_id.as_deref(), &self.config.auth_methods);
        details.insert(
            "agent".to_owned(),
            Value::String(self.config.agent.clone()),
        );
        details.insert(
            "roles".to_owned(),
            Value::Dictionary(roles_dictionary(PeerRole::ALL)),
        );
        Message::Hello(HelloMessage {
            realm: Uri::from_known(self.config.realm.clone()),
            details,
        })
    }

    async fn hello(self: &Arc<Self>) -> Result<()> {
        self.check_not_shut_down()?;
        let (generation, sender) = self.current_connection().await?;
        self.transition_state(SessionState::Authenticating)?;

        let (join_tx, mut join_rx) = unbounded_channel();
        *self.join_tx.lock().await = Some(join_tx);
        let result = match tokio::time::timeout(self.timeout(), self.join(&sender, &mut join_rx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(WampError::WelcomeTimeout.into()),
        };
        self.join_tx.lock().await.take();

        let welcome = match result {
            Ok(welcome) => welcome,
            Err(err) => {
                warn!(
                    "Peer {} failed to join realm {}: {err:#}",
                    self.config.name, self.config.realm
                );
                self.disconnect_connection(Some(generation), false).await;
                return Err(err);
            }
        };

        self.transition_state(SessionState::Connected)?;
        info!(
            "Peer {} started session {} on realm {}",
            self.config.name, welcome.session, self.config.realm
        );

        let auth_method = welcome
            .details
            .get("authmethod")
            .and_then(|auth_method| auth_method.string())
            .unwrap_or("anonymous");
        if auth_method != "anonymous" {
            self.start_heartbeat(generation).await;
        }

        self.replay().await;
        Ok(())
    }

    async fn join(
        &self,
        sender: &ServiceSender,
        join_rx: &mut UnboundedReceiver<Message>,
    ) -> Result<WelcomeMessage> {
        sender.send(self.hello_message()).await?;
        loop {
            match join_rx.recv().await {
                Some(Message::Welcome(message)) => return Ok(message),
                Some(Message::Abort(message)) => return Err(WampError::from(&message).into()),
                Some(Message::Challenge(message)) => {
                    match respond_to_challenge(&self.config.auth_methods, &message) {
                        Ok(authenticate) => {
                            sender.send(Message::Authenticate(authenticate)).await?;
                        }
                        Err(err) => {
                            if let Some(WampError::Abort { reason, message }) = as_wamp_error(&err)
                            {
                                sender
                                    .send(abort_message_for_error(reason.clone(), message))
                                    .await
                                    .ok();
                            }
                            return Err(err);
                        }
                    }
                }
                Some(message) => {
                    return Err(WampError::ProtocolViolation(format!(
                        "received {} message while joining",
                        message.message_name()
                    ))
                    .into());
                }
                None => {
                    return Err(WampError::Connection(
                        "connection closed while joining".to_owned(),
                    )
                    .into());
                }
            }
        }
    }

    async fn reconnect(self: &Arc<Self>) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.queues.reset_all().await;
        self.connect(true).await?;
        self.hello().await
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let Some(delay) = self.config.auto_reconnect.delay() else {
            return;
        };
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move { inner.reconnect_loop(delay).await });
    }

    async fn reconnect_loop(self: Arc<Self>, delay: Duration) {
        // One reconnection at a time. Later loops find the session restored and stop.
        let _guard = self.reconnect_lock.lock().await;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if self.shut_down.load(Ordering::SeqCst) || self.state() != SessionState::Disconnected
            {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => (),
                _ = shutdown_rx.recv() => return,
            }
            if self.shut_down.load(Ordering::SeqCst) || self.state() != SessionState::Disconnected
            {
                return;
            }
            debug!(
                "Peer {} reconnecting to {}",
                self.config.name, self.config.url
            );
            match self.reconnect().await {
                Ok(()) => {
                    info!("Peer {} reconnected", self.config.name);
                    return;
                }
                Err(err) if is_fatal(&err) => {
                    error!("Peer {} stopped reconnecting: {err:#}", self.config.name);
                    return;
                }
                Err(err) => {
                    error!("Peer {} failed to reconnect: {err:#}", self.config.name);
                }
            }
        }
    }

    async fn replay(self: &Arc<Self>) {
        let registrations = std::mem::take(&mut *self.registrations.lock().await);
        for (old_id, entry) in registrations {
            match self.send_register(&entry).await {
                Ok(id) => {
                    debug!(
                        "Peer {} restored registration of {} as {id}",
                        self.config.name, entry.procedure
                    );
                    self.registrations.lock().await.insert(id, entry);
                }
                Err(err) => {
                    error!(
                        "Peer {} failed to restore registration of {}: {err:#}",
                        self.config.name, entry.procedure
                    );
                    // Kept so that the next reconnection tries again.
                    self.registrations.lock().await.insert(old_id, entry);
                }
            }
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        for (old_id, entry) in subscriptions {
            match self.send_subscribe(&entry).await {
                Ok(id) => {
                    debug!(
                        "Peer {} restored subscription to {} as {id}",
                        self.config.name, entry.topic
                    );
                    self.subscriptions.lock().await.insert(id, entry);
                }
                Err(err) => {
                    error!(
                        "Peer {} failed to restore subscription to {}: {err:#}",
                        self.config.name, entry.topic
                    );
                    self.subscriptions.lock().await.insert(old_id, entry);
                }
            }
        }
    }

    async fn send_register(&self, entry: &RegistrationEntry) -> Result<Id> {
        let reply = self
            .request(|request| {
                Message::Register(RegisterMessage {
                    request,
                    options: entry.options.clone(),
                    procedure: entry.procedure.clone(),
                })
            })
            .await?;
        match reply {
            Message::Registered(message) => Ok(message.registration),
            Message::Error(message) => Err(WampError::from(&message).into()),
            message => Err(unexpected_reply(MessageKind::Registered, &message)),
        }
    }

    async fn send_subscribe(&self, entry: &SubscriptionEntry) -> Result<Id> {
        let reply = self
            .request(|request| {
                Message::Subscribe(SubscribeMessage {
                    request,
                    options: entry.options.clone(),
                    topic: entry.topic.clone(),
                })
            })
            .await?;
        match reply {
            Message::Subscribed(message) => Ok(message.subscription),
            Message::Error(message) => Err(WampError::from(&message).into()),
            message => Err(unexpected_reply(MessageKind::Subscribed, &message)),
        }
    }

    /// Sends a request and waits for the reply with the same request ID.
    async fn request<F>(&self, build: F) -> Result<Message>
    where
        F: FnOnce(Id) -> Message,
    {
        let sender = self.connected_sender().await?;
        let (id, reply_rx) = self.pending.reserve(self.id_allocator.as_ref()).await;
        if let Err(err) = sender.send(build(id)).await {
            self.pending.remove(id).await;
            return Err(err);
        }
        match tokio::time::timeout(self.timeout(), reply_rx).await {
            Ok(Ok(PendingReply::Message(message))) => Ok(message),
            Ok(Ok(PendingReply::Disconnected)) | Ok(Err(_)) => Err(WampError::Connection(
                "disconnected while waiting for a response".to_owned(),
            )
            .into()),
            Err(_) => {
                self.pending.remove(id).await;
                Err(WampError::NoResponse.into())
            }
        }
    }

    /// Tears down the active connection.
    ///
    /// With a generation, only tears down that connection, and returns false if it is no longer
    /// active.
    async fn disconnect_connection(&self, generation: Option<u64>, goodbye: bool) -> bool {
        let connection = {
            let mut connection = self.connection.lock().await;
            match (connection.as_ref(), generation) {
                (Some(active), Some(generation)) if active.generation != generation => {
                    return false;
                }
                (None, Some(_)) => return false,
                _ => connection.take(),
            }
        };
        self.join_tx.lock().await.take();

        if let Some(connection) = connection {
            if goodbye && self.state() == SessionState::Connected {
                let sender = connection.service.sender();
                let goodbye = goodbye_with_close_reason(CloseReason::SystemShutdown);
                if tokio::time::timeout(CLOSE_GRACE, sender.send(goodbye))
                    .await
                    .is_err()
                {
                    debug!("Peer {} could not send GOODBYE in time", self.config.name);
                }
            }
            if let Some(heartbeat) = connection.heartbeat {
                heartbeat.handle.abort();
            }
            connection.service.close(CLOSE_GRACE).await;
        }

        let released = self.pending.disconnect_all().await;
        if released > 0 {
            debug!(
                "Peer {} released {released} pending request(s) on disconnect",
                self.config.name
            );
        }
        self.transition_state(SessionState::Disconnected).ok();
        true
    }

    async fn shutdown(self: &Arc<Self>) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Peer {} shutting down", self.config.name);
        self.shutdown_tx.send(()).ok();
        self.queues.deactivate_all().await;
        self.disconnect_connection(None, true).await;

        let read_loop = self.read_loop.lock().await.take();
        if let Some(mut read_loop) = read_loop {
            if tokio::time::timeout(CLOSE_GRACE, &mut read_loop)
                .await
                .is_err()
            {
                warn!(
                    "Peer {} read loop did not stop in time, aborting it",
                    self.config.name
                );
                read_loop.abort();
            }
        }

        let mut state_rx = self.state_tx.subscribe();
        if tokio::time::timeout(
            self.timeout(),
            state_rx.wait_for(|state| *state == SessionState::Disconnected),
        )
        .await
        .is_err()
        {
            warn!(
                "Peer {} did not reach {} during shutdown",
                self.config.name,
                SessionState::Disconnected
            );
        }
        Ok(())
    }

    async fn take_events(&self) -> Option<(u64, ServiceSender, UnboundedReceiver<ServiceEvent>)> {
        let mut connection = self.connection.lock().await;
        let connection = connection.as_mut()?;
        let events = connection.events.take()?;
        Some((connection.generation, connection.service.sender(), events))
    }

    async fn read_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if self.shut_down.load(Ordering::SeqCst) {
                break;
            }
            let Some((generation, sender, mut events)) = self.take_events().await else {
                let shutting_down = tokio::select! {
                    _ = self.restart.notified() => false,
                    _ = shutdown_rx.recv() => true,
                };
                if shutting_down {
                    break;
                }
                continue;
            };
            match self
                .service_connection(generation, &sender, &mut events, &mut shutdown_rx)
                .await
            {
                ConnectionEnd::Shutdown => break,
                ConnectionEnd::Lost(reason) => {
                    // A connection that was already replaced or closed on purpose is not recovered.
                    if self.disconnect_connection(Some(generation), false).await {
                        warn!("Peer {} lost its connection: {reason}", self.config.name);
                        self.schedule_reconnect();
                    }
                }
            }
        }
        trace!("Peer {} read loop exited", self.config.name);
    }

    async fn service_connection(
        self: &Arc<Self>,
        generation: u64,
        sender: &ServiceSender,
        events: &mut UnboundedReceiver<ServiceEvent>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> ConnectionEnd {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(ServiceEvent::Message(message)) => {
                            let message_name = message.message_name();
                            match self.dispatch(sender, message).await {
                                Ok(Dispatched::Continue) => (),
                                Ok(Dispatched::Closed(reason)) => return ConnectionEnd::Lost(reason),
                                Err(err) => warn!(
                                    "Peer {} failed to handle {message_name} message: {err:#}",
                                    self.config.name
                                ),
                            }
                        }
                        Some(ServiceEvent::Corrupt(err)) => {
                            warn!("Peer {} received a corrupt message: {err:#}", self.config.name);
                        }
                        Some(ServiceEvent::Pong(_)) => self.record_pong(generation).await,
                        Some(ServiceEvent::Failed(reason)) => return ConnectionEnd::Lost(reason),
                        None => return ConnectionEnd::Lost("connection closed".to_owned()),
                    }
                }
                _ = tokio::time::sleep(self.config.loop_timeout) => (),
                _ = shutdown_rx.recv() => return ConnectionEnd::Shutdown,
            }
            if self.heartbeat_stale(generation).await {
                warn!(
                    "Peer {} did not receive a pong within {:?}",
                    self.config.name, self.config.heartbeat.timeout
                );
                return ConnectionEnd::Lost("heartbeat timed out".to_owned());
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, sender: &ServiceSender, message: Message) -> Result<Dispatched> {
        match message {
            Message::Invocation(message) => self.handle_invocation(sender, message).await?,
            Message::Event(message) => self.handle_event(message).await,
            Message::Goodbye(message) => {
                info!(
                    "Peer {} received GOODBYE from the router: {}",
                    self.config.name, message.reason
                );
                sender.send(goodbye_and_out()).await.ok();
                return Ok(Dispatched::Closed(format!(
                    "router closed the session with {}",
                    message.reason
                )));
            }
            message @ (Message::Welcome(_) | Message::Abort(_) | Message::Challenge(_)) => {
                let message = match self.join_tx.lock().await.as_ref() {
                    Some(join_tx) => match join_tx.send(message) {
                        Ok(()) => return Ok(Dispatched::Continue),
                        Err(err) => err.0,
                    },
                    None => message,
                };
                if let Message::Abort(abort) = &message {
                    return Ok(Dispatched::Closed(format!(
                        "router aborted the session with {}",
                        abort.reason
                    )));
                }
                warn!(
                    "Peer {} received unexpected {} message",
                    self.config.name,
                    message.message_name()
                );
            }
            message => match message.request_id() {
                Some(request) => {
                    if let Err(message) = self.pending.resolve(request, message).await {
                        warn!(
                            "Peer {} received {} for request {request}, which is not pending",
                            self.config.name,
                            message.message_name()
                        );
                    }
                }
                None => warn!(
                    "Peer {} received unexpected {} message",
                    self.config.name,
                    message.message_name()
                ),
            },
        }
        Ok(Dispatched::Continue)
    }

    async fn handle_invocation(
        self: &Arc<Self>,
        sender: &ServiceSender,
        message: InvocationMessage,
    ) -> Result<()> {
        let request = message.request;
        let entry = self
            .registrations
            .lock()
            .await
            .get(&message.registration)
            .cloned();
        let entry = match entry {
            Some(entry) => entry,
            None => {
                warn!(
                    "Peer {} received invocation for unknown registration {}",
                    self.config.name, message.registration
                );
                return sender
                    .send(error_for_invocation(
                        request,
                        self.error_uri("error.unknown.uri"),
                        List::from_iter([Value::String(format!(
                            "Unknown registration {}",
                            message.registration
                        ))]),
                    ))
                    .await;
            }
        };

        let failure_uri = self.error_uri("error.invoke.failure");
        let invocation = Invocation {
            request,
            registration: message.registration,
            procedure: entry.procedure.clone(),
            details: message.details.clone(),
            arguments: message.arguments.clone(),
            arguments_keyword: message.arguments_keyword.clone(),
        };
        let context = JobContext::Invocation {
            procedure: entry.procedure.clone(),
            message,
        };

        let name = self.config.name.clone();
        let handler = entry.handler.clone();
        let reply_sender = sender.clone();
        let reply_failure_uri = failure_uri.clone();
        let work = async move {
            let procedure = invocation.procedure.clone();
            let reply = match handler.invoke(invocation).await {
                Ok(value) => Message::Yield(YieldMessage {
                    request,
                    options: Dictionary::default(),
                    arguments: List::from_iter([value]),
                    arguments_keyword: Dictionary::default(),
                }),
                Err(err) => {
                    error!("Peer {name} failed to invoke {procedure}: {err:#}");
                    invocation_failure(request, &reply_failure_uri, &err)
                }
            };
            reply_sender.send(reply).await
        };

        let name = self.config.name.clone();
        let error_sender = sender.clone();
        let error_failure_uri = failure_uri.clone();
        let job = Job::new(context, work).on_error(move |err| {
            error!("Peer {name} could not complete invocation {request}: {err:#}");
            tokio::spawn(async move {
                error_sender
                    .send(invocation_failure(request, &error_failure_uri, &err))
                    .await
                    .ok();
            });
        });

        let queue = self.queues.queue(&entry.queue).await;
        if let Err(err) = queue.submit(job).await {
            warn!(
                "Peer {} rejected invocation {request} of {}: {err:#}",
                self.config.name, entry.procedure
            );
            sender
                .send(invocation_failure(request, &failure_uri, &err))
                .await?;
        }
        Ok(())
    }

    async fn handle_event(self: &Arc<Self>, message: EventMessage) {
        let entry = self
            .subscriptions
            .lock()
            .await
            .get(&message.subscription)
            .cloned();
        let entry = match entry {
            Some(entry) => entry,
            None => {
                warn!(
                    "Peer {} received event for unknown subscription {}",
                    self.config.name, message.subscription
                );
                return;
            }
        };

        let event = Event {
            subscription: message.subscription,
            publication: message.publication,
            topic: entry.topic.clone(),
            details: message.details.clone(),
            arguments: message.arguments.clone(),
            arguments_keyword: message.arguments_keyword.clone(),
        };
        let context = JobContext::Event {
            topic: entry.topic.clone(),
            message,
        };
        let handler = entry.handler.clone();
        let job = Job::new(context, async move { handler.handle(event).await });

        let queue = self.queues.queue(&entry.queue).await;
        if let Err(err) = queue.submit(job).await {
            warn!(
                "Peer {} dropped event for {}: {err:#}",
                self.config.name, entry.topic
            );
        }
    }

    async fn start_heartbeat(&self, generation: u64) {
        let interval = self.config.heartbeat.interval;
        if interval.is_zero() {
            return;
        }
        let mut connection = self.connection.lock().await;
        let connection = match connection.as_mut() {
            Some(connection) if connection.generation == generation => connection,
            _ => return,
        };
        let awaiting_pong_since = Arc::new(Mutex::new(None));
        let handle = tokio::spawn(Self::heartbeat_loop(
            self.config.name.clone(),
            connection.service.sender(),
            awaiting_pong_since.clone(),
            interval,
        ));
        debug!(
            "Peer {} started heartbeat every {interval:?}",
            self.config.name
        );
        connection.heartbeat = Some(Heartbeat {
            handle,
            awaiting_pong_since,
        });
    }

    async fn heartbeat_loop(
        name: String,
        sender: ServiceSender,
        awaiting_pong_since: Arc<Mutex<Option<Instant>>>,
        interval: Duration,
    ) {
        let mut count: u64 = 0;
        loop {
            tokio::time::sleep(interval).await;
            count += 1;
            awaiting_pong_since
                .lock()
                .await
                .get_or_insert_with(Instant::now);
            if let Err(err) = sender.ping(count.to_be_bytes().to_vec()) {
                debug!("Peer {name} stopped heartbeat: {err:#}");
                break;
            }
        }
    }

    async fn record_pong(&self, generation: u64) {
        if let Some(connection) = self.connection.lock().await.as_ref() {
            if connection.generation != generation {
                return;
            }
            if let Some(heartbeat) = &connection.heartbeat {
                heartbeat.awaiting_pong_since.lock().await.take();
            }
        }
    }

    async fn heartbeat_stale(&self, generation: u64) -> bool {
        let connection = self.connection.lock().await;
        let heartbeat = match connection.as_ref() {
            Some(connection) if connection.generation == generation => {
                match &connection.heartbeat {
                    Some(heartbeat) => heartbeat,
                    None => return false,
                }
            }
            _ => return false,
        };
        let awaiting_pong_since = *heartbeat.awaiting_pong_since.lock().await;
        awaiting_pong_since.is_some_and(|since| since.elapsed() > self.config.heartbeat.timeout)
    }
}
