//! Error types for the transport and connection layers.

/// Failures raised by a transport adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("connect attempt cancelled")]
    Cancelled,
}

/// Errors surfaced to callers of the connection manager.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// A send was attempted while the link was not in the `Connected` state.
    /// Callers decide whether to drop, queue or surface the message.
    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(TransportError),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// An in-flight connect was cancelled by `disconnect()` or superseded
    /// by a newer connect.
    #[error("connect cancelled")]
    Cancelled,

    #[error("connection manager has shut down")]
    Shutdown,
}

impl From<TransportError> for LinkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => Self::NotConnected,
            TransportError::Cancelled => Self::Cancelled,
            other => Self::Transport(other),
        }
    }
}
