#![forbid(unsafe_code)]

// Peer-facing error taxonomy for session requests

use crate::media::types::MediaError;
use thiserror::Error;

/// Errors returned to the peer in a failure acknowledgement.
///
/// State never advances when one of these is returned.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Malformed or out-of-order request.
    #[error("{0}")]
    Protocol(String),

    /// The request references a resource the peer does not own.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The media engine rejected the call.
    #[error("Engine error: {0}")]
    Engine(#[from] MediaError),
}

impl SessionError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Wire code carried in failure acknowledgements.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::NotFound(_) => "notFound",
            Self::Engine(_) => "engine",
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
