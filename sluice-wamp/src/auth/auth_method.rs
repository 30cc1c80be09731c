use std::{
    fmt::Display,
    str::FromStr,
};

use serde_string_enum::{
    DeserializeStringEnum,
    SerializeStringEnum,
};

use crate::core::sensitive::Sensitive;

/// Authentication methods.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, SerializeStringEnum, DeserializeStringEnum,
)]
pub enum AuthMethod {
    /// No authentication.
    ///
    /// The router assigns an identity to the session.
    #[default]
    Anonymous,
    /// Ticket-based authentication.
    ///
    /// The client answers the router's challenge with a plaintext credential.
    Ticket,
}

impl TryFrom<&str> for AuthMethod {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "anonymous" => Ok(Self::Anonymous),
            "ticket" => Ok(Self::Ticket),
            _ => Err(Self::Error::msg(format!("invalid auth method: {value}"))),
        }
    }
}

impl FromStr for AuthMethod {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

impl Into<&'static str> for AuthMethod {
    fn into(self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Ticket => "ticket",
        }
    }
}

impl Into<String> for AuthMethod {
    fn into(self) -> String {
        Into::<&'static str>::into(self).to_owned()
    }
}

impl Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Into::<&'static str>::into(*self))
    }
}

/// An authentication method a peer offers to the router, along with its credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupportedAuthMethod {
    Anonymous,
    Ticket {
        id: String,
        ticket: Sensitive<String>,
    },
}

impl SupportedAuthMethod {
    /// The method advertised in HELLO.
    pub fn auth_method(&self) -> AuthMethod {
        match self {
            Self::Anonymous => AuthMethod::Anonymous,
            Self::Ticket { .. } => AuthMethod::Ticket,
        }
    }

    /// The identity the method authenticates as, if it carries one.
    pub fn auth_id(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::Ticket { id, .. } => Some(id),
        }
    }
}
