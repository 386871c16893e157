//! Session error taxonomy. Nothing here is process-fatal: every failure ends as an event or a rejected request.

use std::fmt;

/// Why a pending request's future was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Sent after the session was marked dead.
    #[error("connection dead")]
    ConnectionDead,
    /// Session torn down before a response arrived.
    #[error("session closed before a response arrived")]
    Closed,
    /// Dropped by the reconnect resend policy.
    #[error("request discarded on reconnect")]
    Discarded,
}

/// Why a client session reached `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Heartbeat exhaustion or connect-timeout watchdog.
    Timeout,
    /// Server rejected the init credential.
    Password,
    /// Transport returned no channel for the server.
    ServerMissing,
    /// Server-initiated disconnect with any other reason.
    Remote(String),
    /// Local `disconnect()`.
    Local,
    /// Transport closed with reconnection disabled.
    Closed,
}

impl DisconnectReason {
    /// Map a reason string pushed by the server.
    pub fn from_remote(reason: &str) -> Self {
        match reason {
            "password" => DisconnectReason::Password,
            "timeout" => DisconnectReason::Timeout,
            other => DisconnectReason::Remote(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::Password => "password",
            DisconnectReason::ServerMissing => "server does not exist",
            DisconnectReason::Remote(reason) => reason,
            DisconnectReason::Local => "client",
            DisconnectReason::Closed => "closed",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error from a transport channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("transport i/o: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_reasons_map_to_known_variants() {
        assert_eq!(DisconnectReason::from_remote("password"), DisconnectReason::Password);
        assert_eq!(DisconnectReason::from_remote("timeout"), DisconnectReason::Timeout);
        assert_eq!(
            DisconnectReason::from_remote("server shutdown"),
            DisconnectReason::Remote("server shutdown".into())
        );
    }

    #[test]
    fn reason_strings() {
        assert_eq!(DisconnectReason::ServerMissing.to_string(), "server does not exist");
        assert_eq!(DisconnectReason::Timeout.as_str(), "timeout");
        assert_eq!(DisconnectReason::Remote("bye".into()).as_str(), "bye");
    }
}
