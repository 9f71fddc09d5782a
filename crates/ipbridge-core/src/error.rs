use thiserror::Error;

/// Errors produced by the bridge and its RPC layer.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Destination lookup, remote host/port resolution or connect failed.
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// The peer answered a call with an exception.
    #[error("remote exception: {0}")]
    Remote(String),

    #[error("read side aborted")]
    ReadAborted,

    #[error("listener failed: {0}")]
    Listener(std::io::Error),

    #[error("rpc session disconnected")]
    Disconnected,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for BridgeError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        BridgeError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for BridgeError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        BridgeError::Codec(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
