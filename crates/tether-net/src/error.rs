//! Per-request error type.

use crate::codec::Payload;

/// Why a request did not produce a response payload.
///
/// Delivered exactly once to the caller that issued the request. Connection
/// faults never surface here directly; they show up as status transitions and,
/// for requests caught on a dead socket, as [`RequestError::ConnectionLost`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// No live session: never connected, user-closed, or aborted.
    #[error("not connected")]
    NotConnected,

    /// The per-request timer fired before a matching response arrived.
    #[error("request timed out")]
    Timeout,

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The remote superseded this session with another connection.
    #[error("session superseded by another connection")]
    DuplicateSession,

    /// The request was written to a socket that closed before answering.
    #[error("connection lost before a response arrived")]
    ConnectionLost,

    /// The remote answered with an error payload.
    #[error("remote error ({} bytes)", .0.len())]
    Remote(Payload),

    /// The envelope could not be serialized.
    #[error("failed to encode request: {0}")]
    Encode(String),

    /// The encoded envelope exceeds the socket's frame limit.
    #[error("request frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Encoded size.
        size: usize,
        /// Limit of the socket.
        max: usize,
    },

    /// The engine was terminated.
    #[error("engine stopped")]
    EngineStopped,
}
