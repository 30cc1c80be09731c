use std::fmt::Display;

/// The lifecycle state of a peer's session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Disconnected,
    /// Establishing the transport connection.
    Connecting,
    /// The transport is open, but no session has been joined.
    TransportConnected,
    /// HELLO was sent and the peer is waiting for WELCOME.
    Authenticating,
    /// Joined to the realm.
    Connected,
}

impl SessionState {
    /// Checks if the transition from this state to `next` is allowed.
    ///
    /// Every state can fall back to [`SessionState::Disconnected`].
    pub fn allowed_state_transition(&self, next: &Self) -> bool {
        match (self, next) {
            (_, Self::Disconnected) => true,
            (Self::Disconnected, Self::Connecting) => true,
            (Self::Connecting, Self::TransportConnected) => true,
            (Self::TransportConnected, Self::Authenticating) => true,
            (Self::Authenticating, Self::Connected) => true,
            _ => false,
        }
    }

    /// A transport connection is open.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::TransportConnected | Self::Authenticating | Self::Connected
        )
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::TransportConnected => "TRANSPORT_CONNECTED",
            Self::Authenticating => "AUTHENTICATING",
            Self::Connected => "CONNECTED",
        };
        f.write_str(name)
    }
}
