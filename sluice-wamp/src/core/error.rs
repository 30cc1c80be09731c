use thiserror::Error;

use crate::{
    core::{
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        AbortMessage,
        ErrorMessage,
    },
};

/// Broad category of a [`WampError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The connection to the router failed or is missing.
    Connection,
    /// The router sent something that could not be understood.
    Protocol,
    /// The router refused to establish a session.
    Authentication,
    /// The remote side reported an error for a request.
    Application,
    /// A concurrency queue refused to accept a job.
    Admission,
    /// The operation can never succeed as configured, so it must not be retried.
    Fatal,
}

/// The root error type for everything raised by this library.
///
/// Errors are returned inside of [`anyhow::Error`], so callers can `downcast_ref::<WampError>()`
/// to handle specific variants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WampError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("WAMP is currently disconnected")]
    NotConnected,
    #[error("did not receive a response")]
    NoResponse,
    #[error("timed out waiting for WELCOME")]
    WelcomeTimeout,
    #[error("session aborted with {reason}: {message}")]
    Abort { reason: Uri, message: String },
    #[error("{error}{}", describe_arguments(.arguments))]
    Invocation {
        error: Uri,
        arguments: List,
        arguments_keyword: Dictionary,
    },
    #[error("message corrupt: {0}")]
    MessageCorrupt(String),
    #[error("message of {size} bytes exceeds the maximum payload size of {max} bytes")]
    MessageOversized { size: usize, max: usize },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("waitlist full for queue {0}")]
    WaitlistFull(String),
    #[error("concurrency queue {0} is not configured")]
    UnknownQueue(String),
    #[error("fatal error: {0}")]
    Fatal(String),
    #[error("peer has been shut down")]
    Shutdown,
}

fn describe_arguments(arguments: &List) -> String {
    match arguments.first() {
        Some(Value::String(message)) => format!(": {message}"),
        Some(value) => format!(": {value:?}"),
        None => String::new(),
    }
}

impl WampError {
    /// The broad category of the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(_) | Self::NotConnected | Self::NoResponse => {
                ErrorCategory::Connection
            }
            Self::MessageCorrupt(_) | Self::ProtocolViolation(_) => ErrorCategory::Protocol,
            Self::WelcomeTimeout | Self::Abort { .. } => ErrorCategory::Authentication,
            Self::Invocation { .. } | Self::MessageOversized { .. } => ErrorCategory::Application,
            Self::WaitlistFull(_) | Self::UnknownQueue(_) => ErrorCategory::Admission,
            Self::Fatal(_) | Self::Shutdown => ErrorCategory::Fatal,
        }
    }

    /// The error must not be retried.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Fatal
    }

    /// Creates an invocation error with a single message argument.
    pub fn invocation<S>(error: Uri, message: S) -> Self
    where
        S: Into<String>,
    {
        Self::Invocation {
            error,
            arguments: List::from_iter([Value::String(message.into())]),
            arguments_keyword: Dictionary::default(),
        }
    }
}

impl From<&ErrorMessage> for WampError {
    fn from(value: &ErrorMessage) -> Self {
        // Errors without arguments still carry their URI to the caller.
        let arguments = if value.arguments.is_empty() {
            List::from_iter([Value::String(value.error.to_string())])
        } else {
            value.arguments.clone()
        };
        Self::Invocation {
            error: value.error.clone(),
            arguments,
            arguments_keyword: value.arguments_keyword.clone(),
        }
    }
}

impl From<&AbortMessage> for WampError {
    fn from(value: &AbortMessage) -> Self {
        let message = value
            .details
            .get("message")
            .and_then(|message| message.string())
            .map(|message| message.to_owned())
            .unwrap_or_else(|| value.reason.to_string());
        Self::Abort {
            reason: value.reason.clone(),
            message,
        }
    }
}

/// Returns the [`WampError`] inside of an [`anyhow::Error`], if any.
pub fn as_wamp_error(error: &anyhow::Error) -> Option<&WampError> {
    error.downcast_ref::<WampError>()
}

/// Checks if an error must not be retried.
///
/// Errors that did not originate in this library are assumed to be transient.
pub fn is_fatal(error: &anyhow::Error) -> bool {
    as_wamp_error(error).is_some_and(|error| error.is_fatal())
}

#[cfg(test)]
mod error_test {
    use crate::{
        core::{
            error::{
                ErrorCategory,
                WampError,
                is_fatal,
            },
            id::Id,
            types::{
                Dictionary,
                List,
                Value,
            },
            uri::Uri,
        },
        message::message::{
            AbortMessage,
            ErrorMessage,
        },
    };

    #[test]
    fn error_without_arguments_carries_uri() {
        let message = ErrorMessage {
            request_type: 48,
            request: Id::MIN,
            details: Dictionary::default(),
            error: Uri::try_from("wamp.error.no_such_procedure").unwrap(),
            arguments: List::default(),
            arguments_keyword: Dictionary::default(),
        };
        assert_matches::assert_matches!(WampError::from(&message), WampError::Invocation { arguments, .. } => {
            assert_eq!(arguments, List::from_iter([Value::String("wamp.error.no_such_procedure".to_owned())]));
        });
    }

    #[test]
    fn abort_prefers_details_message() {
        let message = AbortMessage {
            details: Dictionary::from_iter([(
                "message".to_owned(),
                Value::String("bad ticket".to_owned()),
            )]),
            reason: Uri::try_from("wamp.error.not_authorized").unwrap(),
            ..Default::default()
        };
        assert_eq!(
            WampError::from(&message),
            WampError::Abort {
                reason: Uri::try_from("wamp.error.not_authorized").unwrap(),
                message: "bad ticket".to_owned(),
            }
        );
    }

    #[test]
    fn classifies_errors() {
        assert_eq!(
            WampError::WaitlistFull("default".to_owned()).category(),
            ErrorCategory::Admission
        );
        assert!(is_fatal(&WampError::Fatal("bad url".to_owned()).into()));
        assert!(!is_fatal(&WampError::Connection("reset".to_owned()).into()));
        assert!(!is_fatal(&anyhow::Error::msg("io")));
    }

    #[test]
    fn invocation_error_displays_first_argument() {
        let error = WampError::invocation(
            Uri::try_from("error.invoke.failure").unwrap(),
            "Call failed: boom",
        );
        assert_eq!(error.to_string(), "error.invoke.failure: Call failed: boom");
    }
}
