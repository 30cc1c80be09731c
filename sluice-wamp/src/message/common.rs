use crate::{
    core::{
        close::CloseReason,
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
        GoodbyeMessage,
        Message,
        MessageKind,
    },
};

pub fn abort_message_for_error(reason: Uri, message: &str) -> Message {
    Message::Abort(AbortMessage {
        details: Dictionary::from_iter([("message".to_owned(), Value::String(message.to_owned()))]),
        reason,
        ..Default::default()
    })
}

pub fn goodbye_with_close_reason(close_reason: CloseReason) -> Message {
    Message::Goodbye(GoodbyeMessage {
        details: Dictionary::default(),
        reason: close_reason.uri(),
    })
}

pub fn goodbye_and_out() -> Message {
    goodbye_with_close_reason(CloseReason::GoodbyeAndOut)
}

/// An ERROR reply to an INVOCATION.
pub fn error_for_invocation(request: Id, error: Uri, arguments: List) -> Message {
    Message::Error(ErrorMessage {
        request_type: MessageKind::Invocation.code(),
        request,
        details: Dictionary::default(),
        error,
        arguments,
        arguments_keyword: Dictionary::default(),
    })
}
