//! Error types for the client layer and the OAuth gateway.

use crate::client::auth_challenge::AuthRequiredError;
use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
///
/// The first five variants form the failure taxonomy callers are expected to
/// branch on. The rest carry the detail wrapped inside them.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation attempted before `initialize` succeeded or after `close`.
    #[error("client is not connected")]
    NotConnected,

    /// Transport was created but protocol negotiation failed.
    #[error("handshake with {target} failed: {source}")]
    HandshakeFailed {
        /// Command or URL that was being connected.
        target: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A 401-class failure was detected; carries the parsed challenge.
    #[error(transparent)]
    AuthRequired(Box<AuthRequiredError>),

    /// Invalid connection configuration, detected before any I/O.
    #[error("failed to create transport: {0}")]
    TransportCreation(String),

    /// The caller's context was cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline (or the default handshake deadline) elapsed.
    #[error("deadline exceeded")]
    Timeout,

    /// Operation context wrapped around a lower-level failure.
    #[error("{operation} failed: {source}")]
    Operation {
        /// Name of the client operation, e.g. `list_tools`.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// JSON-RPC error returned by the remote server.
    #[error("server returned error {code}: {message}")]
    Protocol {
        /// JSON-RPC error code.
        code: i32,
        /// Error message.
        message: String,
        /// Optional error data.
        data: Option<serde_json::Value>,
    },

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Token validation or token retrieval failure.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Transport-specific errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The connection was closed, or the peer exited.
    #[error("connection closed")]
    ConnectionClosed,

    /// A message could not be framed or decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The remote endpoint answered with a non-success status.
    #[error("HTTP status {status}: {body}")]
    HttpStatus {
        /// Status code.
        status: u16,
        /// Raw `WWW-Authenticate` header, if present.
        www_authenticate: Option<String>,
        /// Response body, possibly empty.
        body: String,
    },

    /// The HTTP request could not be sent.
    #[error("request failed: {0}")]
    Request(String),

    /// The token store had no token and an authorization flow is needed.
    #[error("no token available")]
    NoToken,

    /// Subprocess or socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(TransportError::Io(err))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Request(err.to_string())
    }
}

impl Error {
    /// Create a protocol error from a JSON-RPC error object.
    pub fn protocol(code: i32, message: impl Into<String>) -> Self {
        Error::Protocol {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Strip `Operation` wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error means the client must (re)connect first.
    pub fn is_not_connected(&self) -> bool {
        matches!(self.root(), Error::NotConnected)
    }

    /// Whether the operation was cancelled by the caller.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }

    /// Whether the handshake failed for a reason other than authentication.
    pub fn is_handshake_failed(&self) -> bool {
        matches!(self.root(), Error::HandshakeFailed { .. })
    }

    /// The authentication challenge, if this is an auth-required failure.
    pub fn auth_required(&self) -> Option<&AuthRequiredError> {
        match self.root() {
            Error::AuthRequired(err) => Some(err),
            Error::HandshakeFailed { source, .. } => source.auth_required(),
            _ => None,
        }
    }

    /// HTTP status evidence carried anywhere in the wrapper chain.
    pub fn http_status(&self) -> Option<(u16, Option<&str>)> {
        match self {
            Error::Operation { source, .. } | Error::HandshakeFailed { source, .. } => {
                source.http_status()
            },
            Error::Transport(TransportError::HttpStatus {
                status,
                www_authenticate,
                ..
            }) => Some((*status, www_authenticate.as_deref())),
            _ => None,
        }
    }
}
