//! Error types for the shared socket layers.
//!
//! None of these are fatal: the proxy recovers from `ContextError` by going
//! direct, the hub logs and drops on `ProtocolError`, and `RemoteError`
//! surfaces to listeners as a `connect_error` event. `ConfigError` is the
//! exception and stops a proxy from being built at all.

/// The shared background context could not be reached.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContextError {
    #[error("shared context unavailable: {0}")]
    Unavailable(String),

    #[error("shared context failed to start: {0}")]
    Construction(String),

    #[error("no tokio runtime available to host the hub")]
    NoRuntime,
}

/// The remote collaborator refused or failed an operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("invalid remote address: {0}")]
    InvalidAddress(String),

    #[error("websocket transport is not enabled in the socket options")]
    WebsocketDisabled,

    #[error("no tokio runtime available to drive the connection")]
    NoRuntime,
}

/// A channel message did not decode into a known envelope.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unhandled eventType: {0}")]
    UnknownEventType(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

/// Errors returned by the async request helper on the client proxy.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("acknowledgement dropped before a response arrived")]
    AckDropped,

    #[error("failed to encode payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Configuration could not be loaded or did not make sense.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(Box<figment::Error>),

    #[error("invalid socket options: {0}")]
    InvalidOptions(#[from] serde_json::Error),

    #[error("no remote url configured")]
    MissingUrl,
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

impl ProtocolError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnknownEventType(_) => "unknown_event_type",
            Self::MissingField(_) => "missing_field",
        }
    }
}
