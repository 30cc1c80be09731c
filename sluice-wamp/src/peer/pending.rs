use futures_util::lock::Mutex;
use tokio::sync::oneshot;

use crate::{
    core::{
        hash::HashMap,
        id::{
            Id,
            IdAllocator,
        },
    },
    message::message::Message,
};

/// A reply delivered to a pending request.
#[derive(Debug)]
pub enum PendingReply {
    Message(Message),
    /// The connection was torn down before a reply arrived.
    Disconnected,
}

/// Table of requests waiting for a reply, keyed by request ID.
///
/// Each entry is resolved at most once. Resolving removes the entry.
#[derive(Default)]
pub struct PendingRequests {
    requests: Mutex<HashMap<Id, oneshot::Sender<PendingReply>>>,
}

impl PendingRequests {
    /// Reserves a fresh request ID that does not collide with any pending request.
    pub async fn reserve(
        &self,
        id_allocator: &dyn IdAllocator,
    ) -> (Id, oneshot::Receiver<PendingReply>) {
        let mut requests = self.requests.lock().await;
        let mut id = id_allocator.generate_id();
        while requests.contains_key(&id) {
            id = id_allocator.generate_id();
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        requests.insert(id, reply_tx);
        (id, reply_rx)
    }

    /// Delivers a reply to the request with the given ID.
    ///
    /// Gives the message back if no request is waiting for it.
    pub async fn resolve(&self, id: Id, message: Message) -> Result<(), Message> {
        let reply_tx = self.requests.lock().await.remove(&id);
        match reply_tx {
            Some(reply_tx) => match reply_tx.send(PendingReply::Message(message)) {
                Ok(()) => Ok(()),
                // The requester gave up.
                Err(PendingReply::Message(message)) => Err(message),
                Err(PendingReply::Disconnected) => Ok(()),
            },
            None => Err(message),
        }
    }

    /// Forgets a request, such as one that timed out.
    pub async fn remove(&self, id: Id) {
        self.requests.lock().await.remove(&id);
    }

    /// Resolves every pending request as disconnected.
    ///
    /// Returns the number of requests that were pending.
    pub async fn disconnect_all(&self) -> usize {
        let requests = std::mem::take(&mut *self.requests.lock().await);
        let count = requests.len();
        for (_, reply_tx) in requests {
            reply_tx.send(PendingReply::Disconnected).ok();
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.requests.lock().await.len()
    }
}
