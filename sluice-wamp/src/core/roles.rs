use std::fmt::Display;

use crate::core::types::{
    Dictionary,
    Value,
};

/// A role a client can take on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRole {
    // Calls RPC endpoints.
    Caller,
    // Registers RPC endpoints.
    Callee,
    // Publishes events to topics.
    Publisher,
    // Subscribes to events for topics.
    Subscriber,
}

impl PeerRole {
    /// Every role, in the order announced to the router.
    pub const ALL: [PeerRole; 4] = [
        PeerRole::Caller,
        PeerRole::Callee,
        PeerRole::Publisher,
        PeerRole::Subscriber,
    ];
}

impl TryFrom<&str> for PeerRole {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "caller" => Ok(Self::Caller),
            "callee" => Ok(Self::Callee),
            "publisher" => Ok(Self::Publisher),
            "subscriber" => Ok(Self::Subscriber),
            _ => Err(Self::Error::msg(format!("invalid peer role: {value}"))),
        }
    }
}

impl Into<&'static str> for PeerRole {
    fn into(self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Callee => "callee",
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
        }
    }
}

impl Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Into::<&'static str>::into(*self))
    }
}

/// Builds the `roles` dictionary sent in HELLO details.
///
/// No advanced features are announced, so every role maps to an empty dictionary.
pub fn roles_dictionary<I>(roles: I) -> Dictionary
where
    I: IntoIterator<Item = PeerRole>,
{
    roles
        .into_iter()
        .map(|role| (role.to_string(), Value::Dictionary(Dictionary::default())))
        .collect()
}
