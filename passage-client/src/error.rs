//! Client-side error type.

use passage_core::CodecError;
use thiserror::Error;

/// Errors surfaced by client sessions and tunnels.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The server answered with a non-empty `Error` field.
    #[error("{0}")]
    Rejected(String),

    #[error("Tunnel closed")]
    TunnelClosed,

    #[error("Already closed")]
    AlreadyClosed,

    #[error("session is not connected")]
    NotConnected,

    #[error("session closed")]
    SessionClosed,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(CodecError::Malformed(err))
    }
}
