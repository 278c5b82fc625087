use std::io;
use thiserror::Error;

/// Errors raised by the handshake, the frame codec and the request reader.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Request lacks `Upgrade: websocket` (or the key to answer it with).
    #[error("request is not a WebSocket upgrade")]
    NotAWebSocketUpgrade,

    /// Declared or required payload length is outside the 16-bit range.
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Payload is not UTF-8 or not JSON.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Peer sent a close frame.
    #[error("connection closed by peer")]
    ConnectionClosedByPeer,

    /// Buffer ends before the declared frame does.
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    IncompleteFrame { needed: usize, available: usize },

    /// Client frame arrived without a mask while masking is required.
    #[error("client frame is not masked")]
    UnmaskedFrame,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("request head exceeds {limit} bytes")]
    RequestHeadTooLarge { limit: usize },
}

/// Invalid configuration value.
#[derive(Debug, Error)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Errors that stop the server process.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to install logger: {0}")]
    Logger(#[from] log::SetLoggerError),
}
