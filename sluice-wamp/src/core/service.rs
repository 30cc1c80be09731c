use std::time::Duration;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use log::{
    debug,
    error,
    trace,
};
use tokio::{
    sync::{
        broadcast,
        mpsc::{
            UnboundedReceiver,
            UnboundedSender,
            unbounded_channel,
        },
        oneshot,
    },
    task::JoinHandle,
};

use crate::{
    core::{
        error::WampError,
        stream::{
            MessageStream,
            StreamMessage,
        },
    },
    message::message::Message,
};

/// An event produced by a running [`Service`] for the layer above it.
#[derive(Debug)]
pub enum ServiceEvent {
    /// A decoded message.
    Message(Message),
    /// A frame that could not be decoded. The connection stays open.
    Corrupt(Error),
    /// The other side answered a ping.
    Pong(Vec<u8>),
    /// The connection failed. No more events follow.
    Failed(String),
}

enum ServiceCommand {
    Send(Message, oneshot::Sender<Result<()>>),
    Ping(Vec<u8>),
}

/// A cloneable handle for writing to a running [`Service`].
#[derive(Clone)]
pub struct ServiceSender {
    command_tx: UnboundedSender<ServiceCommand>,
}

impl ServiceSender {
    /// Sends a message over the connection, waiting until it has been written.
    pub async fn send(&self, message: Message) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send(ServiceCommand::Send(message, ack_tx))
            .map_err(|_| WampError::Connection("connection closed".to_owned()))?;
        ack_rx
            .await
            .map_err(|_| WampError::Connection("connection closed".to_owned()))?
    }

    /// Sends a ping over the connection without waiting for it to be written.
    pub fn ping(&self, data: Vec<u8>) -> Result<()> {
        self.command_tx
            .send(ServiceCommand::Ping(data))
            .map_err(|_| WampError::Connection("connection closed".to_owned()).into())
    }

    /// Checks if the service is no longer accepting messages.
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

/// A handle to an asynchronously-running [`Service`].
pub struct ServiceHandle {
    start_handle: JoinHandle<()>,
    cancel_tx: broadcast::Sender<()>,
    sender: ServiceSender,
}

impl ServiceHandle {
    /// The message transmission handle.
    pub fn sender(&self) -> ServiceSender {
        self.sender.clone()
    }

    /// Cancels the service.
    ///
    /// Messages already queued are written before the transport closes.
    pub fn cancel(&self) {
        self.cancel_tx.send(()).ok();
    }

    /// Cancels the service and waits for it to finish.
    ///
    /// If the service does not finish within the grace period, its task is aborted, which drops
    /// the transport.
    pub async fn close(mut self, grace: Duration) {
        self.cancel();
        if tokio::time::timeout(grace, &mut self.start_handle)
            .await
            .is_err()
        {
            debug!("Service did not stop within {grace:?}, aborting it");
            self.start_handle.abort();
        }
    }
}

/// The core asynchronous service that sends and receives WAMP messages over an underlying
/// transport.
///
/// One service runs per connection. Received messages are passed to a channel for the peer to
/// process, and the peer writes messages through a [`ServiceSender`]. The service never injects
/// protocol messages of its own, except for answering pings.
pub struct Service {
    name: String,
    stream: MessageStream,
    event_tx: UnboundedSender<ServiceEvent>,
    cancel_tx: broadcast::Sender<()>,
    cancel_rx: broadcast::Receiver<()>,
    command_tx: UnboundedSender<ServiceCommand>,
    command_rx: UnboundedReceiver<ServiceCommand>,
}

impl Service {
    /// Creates a new service over the given message stream, along with the receiver of its events.
    pub fn new(name: String, stream: MessageStream) -> (Self, UnboundedReceiver<ServiceEvent>) {
        let (event_tx, event_rx) = unbounded_channel();
        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        let (command_tx, command_rx) = unbounded_channel();
        (
            Self {
                name,
                stream,
                event_tx,
                cancel_tx,
                cancel_rx,
                command_tx,
                command_rx,
            },
            event_rx,
        )
    }

    /// Starts the service asynchronously.
    ///
    /// This method takes ownership of the service. All future interactions with the service should
    /// be made through the returned handle.
    pub fn start(self) -> ServiceHandle {
        let cancel_tx = self.cancel_tx.clone();
        let sender = ServiceSender {
            command_tx: self.command_tx.clone(),
        };
        let start_handle = tokio::spawn(self.run());
        ServiceHandle {
            start_handle,
            cancel_tx,
            sender,
        }
    }

    async fn run(mut self) {
        // The handle keeps its own sender, so the command channel never closes by itself.
        let result = self.service_loop().await;
        if let Err(err) = &result {
            error!("Service {} failed: {err:#}", self.name);
            self.event_tx
                .send(ServiceEvent::Failed(format!("{err:#}")))
                .ok();
        }
        self.command_rx.close();
        // Ignore error with the stream, since it may already be closed.
        self.stream.close().await.ok();
        trace!("Service {} ended", self.name);
    }

    async fn service_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                message = self.stream.next() => {
                    match message {
                        Some(Ok(StreamMessage::Ping(data))) => {
                            self.stream.send(StreamMessage::Pong(data)).await?;
                        }
                        Some(Ok(StreamMessage::Pong(data))) => {
                            self.event_tx.send(ServiceEvent::Pong(data)).ok();
                        }
                        Some(Ok(StreamMessage::Message(message))) => {
                            trace!("Service {} received message: {message:?}", self.name);
                            self.event_tx.send(ServiceEvent::Message(message)).ok();
                        }
                        Some(Err(err)) => {
                            match err.downcast_ref::<WampError>() {
                                Some(WampError::MessageCorrupt(_)) => {
                                    self.event_tx.send(ServiceEvent::Corrupt(err)).ok();
                                }
                                _ => return Err(err),
                            }
                        }
                        None => {
                            return Err(Error::msg("connection closed by the router"));
                        }
                    }
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => self.execute(command).await?,
                        None => return Err(Error::msg("command stream closed")),
                    }
                }
                _ = self.cancel_rx.recv() => {
                    // Flush whatever was queued before cancellation, such as a GOODBYE.
                    while let Ok(command) = self.command_rx.try_recv() {
                        self.execute(command).await.ok();
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn execute(&mut self, command: ServiceCommand) -> Result<()> {
        match command {
            ServiceCommand::Send(message, ack_tx) => {
                trace!("Service {} sending message: {message:?}", self.name);
                match self.stream.send(StreamMessage::Message(message)).await {
                    Ok(()) => {
                        ack_tx.send(Ok(())).ok();
                        Ok(())
                    }
                    Err(err) => {
                        // An oversized message is the caller's problem, not the connection's.
                        let oversized = matches!(
                            err.downcast_ref::<WampError>(),
                            Some(WampError::MessageOversized { .. })
                        );
                        let reason = format!("{err:#}");
                        ack_tx.send(Err(err)).ok();
                        if oversized {
                            Ok(())
                        } else {
                            Err(Error::msg(reason))
                        }
                    }
                }
            }
            ServiceCommand::Ping(data) => self.stream.send(StreamMessage::Ping(data)).await,
        }
    }
}
