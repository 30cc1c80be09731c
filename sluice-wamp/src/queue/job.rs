use std::{
    fmt::Display,
    future::Future,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::future::BoxFuture;
use log::error;

use crate::{
    core::uri::Uri,
    message::message::{
        EventMessage,
        InvocationMessage,
    },
};

/// What a job is running, for admission policies to inspect.
#[derive(Debug, Clone)]
pub enum JobContext {
    /// An invocation of a registered procedure.
    Invocation {
        procedure: Uri,
        message: InvocationMessage,
    },
    /// An event delivered to a subscription.
    Event { topic: Uri, message: EventMessage },
    /// Arbitrary work submitted directly to a queue.
    Task(String),
}

impl Display for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invocation { procedure, message } => {
                write!(f, "invocation {} of {procedure}", message.request)
            }
            Self::Event { topic, message } => {
                write!(f, "event {} on {topic}", message.publication)
            }
            Self::Task(label) => write!(f, "task {label}"),
        }
    }
}

/// A unit of work run by a [`ConcurrencyQueue`][crate::queue::queue::ConcurrencyQueue].
pub struct Job {
    pub context: JobContext,
    pub(crate) work: BoxFuture<'static, Result<()>>,
    pub(crate) on_error: Box<dyn FnOnce(Error) + Send>,
}

impl Job {
    /// Creates a new job.
    ///
    /// Failures are logged unless an error callback is attached with [`Job::on_error`].
    pub fn new<F>(context: JobContext, work: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let label = context.to_string();
        Self {
            context,
            work: Box::pin(work),
            on_error: Box::new(move |err| error!("Job for {label} failed: {err:#}")),
        }
    }

    /// Sets the callback that receives the job's failure.
    ///
    /// Failures of the work itself and failures of the queue's admission policy are both reported
    /// here.
    pub fn on_error<E>(mut self, on_error: E) -> Self
    where
        E: FnOnce(Error) + Send + 'static,
    {
        self.on_error = Box::new(on_error);
        self
    }
}
