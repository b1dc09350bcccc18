//! Error types for the Sailhouse SDK.

use thiserror::Error;

/// Result type alias using SailhouseError.
pub type Result<T> = std::result::Result<T, SailhouseError>;

/// Error type returned by subscription handlers.
///
/// Any `std::error::Error + Send + Sync` converts into it with `?`, as does
/// `anyhow::Error`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when using the Sailhouse SDK.
#[derive(Error, Debug)]
pub enum SailhouseError {
    /// Authentication error (missing or rejected token).
    #[error("authentication error: {0}")]
    Auth(String),

    /// The service answered with an unexpected status code.
    #[error("API error ({status}) from {endpoint}: {message}")]
    Api {
        status: u16,
        endpoint: String,
        message: String,
    },

    /// Connection error (network, WebSocket handshake).
    #[error("connection error: {0}")]
    Connection(String),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// URL parsing error.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// `start` was called on a subscriber with nothing registered.
    #[error("no subscriptions registered")]
    NoSubscriptions,

    /// `start` was called on a subscriber that is already running.
    #[error("subscriber is already running")]
    AlreadyRunning,

    /// The subscriber has been stopped and cannot be started again.
    #[error("subscriber has been stopped and cannot be restarted")]
    Stopped,

    /// `register` was called after the subscriber was started.
    #[error("cannot register {topic}/{subscription}: subscriber has already been started")]
    RegistrationClosed { topic: String, subscription: String },
}

impl SailhouseError {
    /// Create an authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create an API error with status code and the endpoint that produced it.
    pub fn api(status: u16, endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a WebSocket error.
    pub fn websocket(msg: impl Into<String>) -> Self {
        Self::WebSocket(msg.into())
    }

    /// HTTP status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
