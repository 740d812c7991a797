//! Error types shared by the transport, handshake and RPC layers.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the connection layer.
///
/// Transient socket errors (`EINTR`, `EAGAIN`) are retried internally and
/// never appear here. Every other kind terminates the affected connection or
/// negotiation, never the process.
#[derive(Debug, Error)]
pub enum Error {
    /// A non-transient OS error.
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// The peer closed the connection, or it was shut down locally.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The peers share no wire protocol.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Malformed frame, size mismatch, or unexpected/missing descriptors.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The remote handler failed; the message is the one it reported.
    #[error("remote handler failed: {0}")]
    Handler(String),

    /// Programmer misuse of an API.
    #[error("usage error: {0}")]
    Usage(String),

    /// The operation was abandoned before it produced a result.
    #[error("operation cancelled")]
    Cancelled,

    /// A deadline elapsed.
    #[error("timed out: {0}")]
    TimedOut(String),
}

impl Error {
    pub(crate) fn io(context: &'static str, source: impl Into<io::Error>) -> Self {
        Self::Io {
            context,
            source: source.into(),
        }
    }

    pub(crate) fn violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Whether this error means the connection is gone.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}
