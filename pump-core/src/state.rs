//! Connection lifecycle states and the transitions allowed between them.

use serde::Serialize;

/// Lifecycle of the link to one paired pump. Owned by the connection manager; everything
/// else only observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    /// Bond lost or pairing rejected; the user must re-pair before anything else happens.
    AuthFailed,
}

impl ConnectionState {
    /// Transition table. Staying in the same state is always allowed, and so is dropping
    /// to `Disconnected` (caller-initiated disconnect).
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if self == next || next == Disconnected {
            return true;
        }
        matches!(
            (self, next),
            (Disconnected, Scanning)
                | (Disconnected, Connecting)
                | (Scanning, Connecting)
                | (Scanning, Reconnecting)
                | (Scanning, AuthFailed)
                | (Connecting, Authenticating)
                | (Connecting, Reconnecting)
                | (Connecting, AuthFailed)
                | (Authenticating, Connected)
                | (Authenticating, Reconnecting)
                | (Authenticating, AuthFailed)
                | (Connected, Reconnecting)
                | (Connected, AuthFailed)
                | (Reconnecting, Scanning)
                | (Reconnecting, Connecting)
                | (Reconnecting, AuthFailed)
        )
    }

    /// States in which a connection attempt is under way.
    pub fn is_attempting(self) -> bool {
        matches!(
            self,
            ConnectionState::Scanning
                | ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Scanning => "SCANNING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Authenticating => "AUTHENTICATING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::AuthFailed => "AUTH_FAILED",
        };
        f.write_str(s)
    }
}
