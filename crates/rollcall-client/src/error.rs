//! Client error type.

use thiserror::Error;

use rollcall_core::errors::{AuthError, TransportError};

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server refused our identity. Not retried automatically.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Network failure; the connection manager backs off and redials.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The REST resync endpoint answered with an error status.
    #[error("snapshot request failed with {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// A frame or response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The manager was disconnected while an operation was in flight.
    #[error("connection manager stopped")]
    Stopped,
}

impl ClientError {
    /// Shorthand for a transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(TransportError(message.into()))
    }

    /// Whether the reconnect loop should keep going after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Decode(_) => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Auth(_) | Self::Stopped => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::transport(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::transport(e.to_string())
    }
}
