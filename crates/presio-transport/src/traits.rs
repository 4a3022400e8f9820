//! Transport abstraction for the presence service pipe.
//!
//! The engine in `presio-core` talks to a [`Transport`] rather than to a
//! socket directly, so tests can substitute a scripted transport and the
//! IPC details stay in one place.

use async_trait::async_trait;
use presio_protocol::{Activity, User};
use thiserror::Error;

/// Event categories a client can subscribe to after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The local user accepted an invite to join another session.
    ActivityJoin,
    /// Another user asked to join the local session.
    ActivityJoinRequest,
    /// The local user chose to spectate another session.
    ActivitySpectate,
}

impl EventKind {
    /// Wire name of the event category.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ActivityJoin => "ACTIVITY_JOIN",
            EventKind::ActivityJoinRequest => "ACTIVITY_JOIN_REQUEST",
            EventKind::ActivitySpectate => "ACTIVITY_SPECTATE",
        }
    }
}

/// An event surfaced by the presence service over the pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The handshake completed and the service identified the local user.
    Ready { user: User },
    /// The pipe was closed by the service.
    Disconnected { code: i64, message: String },
    /// The service reported an error for a prior command.
    Error { code: i64, message: String },
    /// Another user asked to join the local session.
    JoinRequest { user: User },
    /// The local user accepted an invite; carries the join secret.
    JoinGame { secret: String },
    /// The local user chose to spectate; carries the spectate secret.
    SpectateGame { secret: String },
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No presence service socket was found on this machine.
    #[error("Presence service is not running")]
    ServiceAbsent,

    /// A command was issued before the pipe was established.
    #[error("Not connected to the presence service")]
    NotConnected,

    /// The pipe was closed while a command was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The service rejected the handshake.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Framing or payload error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] presio_protocol::ProtocolError),

    /// I/O error on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether a retry against the same transport can succeed later.
    ///
    /// An absent service or a dropped pipe is worth retrying; a rejected
    /// handshake is not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ServiceAbsent
                | TransportError::ConnectionClosed
                | TransportError::Io(_)
        )
    }
}

/// A connection to the presence service.
///
/// Implementations push [`TransportEvent`]s through the channel handed to
/// them at construction; commands flow through the methods below.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the pipe and perform the handshake.
    ///
    /// A `Ready` event is emitted once the service acknowledges.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Subscribe to an event category.
    async fn subscribe(&self, kind: EventKind) -> Result<(), TransportError>;

    /// Publish the given activity, or clear it when `None`.
    async fn set_activity(&self, activity: Option<Activity>) -> Result<(), TransportError>;

    /// Answer a pending join request from `user_id`.
    async fn respond_to_join_request(
        &self,
        user_id: &str,
        accept: bool,
    ) -> Result<(), TransportError>;

    /// Close the pipe gracefully.
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether the pipe is currently open.
    fn is_connected(&self) -> bool;

    /// Transport name for logging (e.g. "ipc").
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(TransportError::ServiceAbsent.is_transient());
        assert!(TransportError::ConnectionClosed.is_transient());
        assert!(!TransportError::NotConnected.is_transient());
        assert!(!TransportError::HandshakeFailed("bad client id".into()).is_transient());
    }
}
