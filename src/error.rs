//! Error types for the RFB server library.

use std::io;
use thiserror::Error;

/// Result type for RFB operations.
pub type Result<T> = std::result::Result<T, VncError>;

/// Errors that can occur in RFB server operations.
///
/// Timeouts are not represented here: they are a normal outcome of
/// [`crate::io::BufferedIo`] calls, not an error. [`VncError::Protocol`] and
/// [`VncError::Transport`] are always local to a single connection and never
/// propagate to the server.
#[derive(Debug, Error)]
pub enum VncError {
    /// Underlying OS I/O failure (bind, accept, allocation-adjacent failures).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read/write/accept failed, timed out past retry, or the peer went away.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed handshake or message: bad ProtocolVersion, wrong security
    /// type, invalid pixel format, unknown message type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A constructor or setter was called with an invalid argument (bad
    /// dimensions, unsupported bpp, inconsistent pixel format).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The bounded event queue was full; the event was dropped.
    #[error("event queue is full")]
    QueueFull,
}

impl VncError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        VncError::Protocol(msg.into())
    }

    pub(crate) fn transport(msg: impl Into<String>) -> Self {
        VncError::Transport(msg.into())
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        VncError::InvalidArgument(msg.into())
    }
}
