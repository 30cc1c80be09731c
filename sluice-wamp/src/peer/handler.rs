use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::{
    id::Id,
    types::{
        Dictionary,
        List,
        Value,
    },
    uri::Uri,
};

/// An invocation of a registered procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub request: Id,
    pub registration: Id,
    pub procedure: Uri,
    pub details: Dictionary,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// An event published to a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub subscription: Id,
    pub publication: Id,
    pub topic: Uri,
    pub details: Dictionary,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// Handles invocations of a registered procedure.
///
/// The returned value is sent back to the caller as the single argument of the result. Returning a
/// [`WampError::Invocation`][crate::core::error::WampError::Invocation] chooses the error URI and
/// arguments the caller receives. Any other error is reported as an invocation failure.
#[async_trait]
pub trait ProcedureHandler: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> ProcedureHandler for F
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn invoke(&self, invocation: Invocation) -> Result<Value> {
        self(invocation).await
    }
}

/// Handles events published to a subscribed topic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> Result<()> {
        self(event).await
    }
}
