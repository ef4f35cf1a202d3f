//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the sync core returns [`SyncError`]. The enum is
//! `Clone` because a single in-flight room setup is shared between every caller
//! that asked for it, and each of them receives the same result.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures reported by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The server refused the credentials presented during the handshake.
    #[error("server rejected credentials: {0}")]
    Unauthorized(String),
    /// The connection is not open.
    #[error("transport is not connected")]
    NotConnected,
    /// The connection dropped or the peer closed it.
    #[error("connection closed: {0}")]
    Closed(String),
    /// Any other I/O or protocol failure.
    #[error("transport failure: {0}")]
    Io(String),
    /// The server answered a request with an error payload.
    #[error("request rejected by server: {0}")]
    Rejected(String),
}

/// Every error the sync core can surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Credentials are invalid or the session is gone. Never retried locally.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("timed out after {0:?} waiting for the connection")]
    ConnectionTimeout(Duration),

    #[error("timed out after {0:?} fetching room metadata")]
    MetadataTimeout(Duration),

    #[error("timed out after {0:?} joining room")]
    JoinTimeout(Duration),

    #[error("timed out after {0:?} loading message history")]
    HistoryLoadTimeout(Duration),

    /// Recoverable through the reconnection backoff.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The backoff loop gave up; the user must reload.
    #[error("connection lost after {attempts} reconnection attempts")]
    ReconnectExhausted { attempts: u32 },

    /// A streamed AI response failed; its partial content was discarded.
    #[error("streaming response {id} failed: {message}")]
    Streaming { id: String, message: String },

    /// An optimistic reaction change was rejected or never confirmed.
    #[error("reaction {emoji} on {message_id} was not confirmed")]
    ReactionConflict { message_id: String, emoji: String },

    #[error("no room is selected")]
    NoRoomSelected,

    #[error("message {0} is not in the timeline")]
    UnknownMessage(String),

    #[error("message content is empty")]
    EmptyMessage,

    /// The operation's result arrived after the room or view went away.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Fatal errors force navigation away from the room.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(_)
                | SyncError::ReconnectExhausted { .. }
                | SyncError::Transport(TransportError::Unauthorized(_))
        )
    }

    /// Whether a caller may reasonably try the same operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ConnectionTimeout(_)
            | SyncError::MetadataTimeout(_)
            | SyncError::JoinTimeout(_)
            | SyncError::HistoryLoadTimeout(_) => true,
            SyncError::Transport(e) => !matches!(e, TransportError::Unauthorized(_)),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_is_fatal_and_not_retryable() {
        let e = SyncError::Auth("expired".into());
        assert!(e.is_fatal());
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_timeouts_are_retryable() {
        let d = Duration::from_secs(1);
        for e in [
            SyncError::ConnectionTimeout(d),
            SyncError::MetadataTimeout(d),
            SyncError::JoinTimeout(d),
            SyncError::HistoryLoadTimeout(d),
        ] {
            assert!(e.is_retryable(), "{e} should be retryable");
            assert!(!e.is_fatal());
        }
    }

    #[test]
    fn test_unauthorized_transport_error_is_fatal() {
        let e: SyncError = TransportError::Unauthorized("bad token".into()).into();
        assert!(e.is_fatal());
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_io_transport_error_is_retryable() {
        let e: SyncError = TransportError::Io("reset".into()).into();
        assert!(e.is_retryable());
        assert!(!e.is_fatal());
    }

    #[test]
    fn test_reconnect_exhausted_display_mentions_attempts() {
        let e = SyncError::ReconnectExhausted { attempts: 5 };
        assert!(e.to_string().contains('5'));
        assert!(e.is_fatal());
    }

    #[test]
    fn test_reaction_conflict_is_neither_fatal_nor_retryable() {
        let e = SyncError::ReactionConflict { message_id: "m1".into(), emoji: "👍".into() };
        assert!(!e.is_fatal());
        assert!(!e.is_retryable());
    }
}
