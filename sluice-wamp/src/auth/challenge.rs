use anyhow::Result;

use crate::{
    auth::auth_method::{
        AuthMethod,
        SupportedAuthMethod,
    },
    core::{
        error::WampError,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        AuthenticateMessage,
        ChallengeMessage,
    },
};

/// Builds the authentication entries of HELLO details.
///
/// An explicit `auth_id` takes precedence over one carried by a configured method.
pub fn hello_auth_details(auth_id: Option<&str>, methods: &[SupportedAuthMethod]) -> Dictionary {
    let mut details = Dictionary::default();
    let auth_id = auth_id.or_else(|| methods.iter().find_map(|method| method.auth_id()));
    if let Some(auth_id) = auth_id {
        details.insert("authid".to_owned(), Value::String(auth_id.to_owned()));
    }
    if !methods.is_empty() {
        details.insert(
            "authmethods".to_owned(),
            Value::List(List::from_iter(
                methods
                    .iter()
                    .map(|method| Value::String(method.auth_method().into())),
            )),
        );
    }
    details
}

/// Answers a CHALLENGE with the matching configured method.
///
/// A challenge for a method that was not configured fails with [`WampError::Abort`].
pub fn respond_to_challenge(
    methods: &[SupportedAuthMethod],
    challenge: &ChallengeMessage,
) -> Result<AuthenticateMessage> {
    let method = AuthMethod::try_from(challenge.auth_method.as_str()).ok();
    let supported = method.and_then(|method| {
        methods
            .iter()
            .find(|supported| supported.auth_method() == method)
    });
    match supported {
        Some(SupportedAuthMethod::Ticket { ticket, .. }) => Ok(AuthenticateMessage {
            signature: ticket.clone(),
            extra: Dictionary::default(),
        }),
        _ => Err(WampError::Abort {
            reason: Uri::from_known("wamp.error.authentication_failed"),
            message: format!(
                "cannot respond to challenge for auth method {}",
                challenge.auth_method
            ),
        }
        .into()),
    }
}
