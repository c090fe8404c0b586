use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Convenient type alias for `Result<T, MuxError>`.
pub type Result<T> = std::result::Result<T, MuxError>;

/// Error types for the chanmux library.
///
/// Nothing in this crate treats these as fatal: the engine logs them and
/// keeps the physical connection alive wherever it can. They surface to
/// callers from `send`, from configuration and from URL parsing.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Channel handshake still pending")]
    HandshakePending,

    #[error("Session closed")]
    SessionClosed,

    #[error("Transport already attached to session")]
    AlreadyAttached,

    #[error("No free channel id after {0} draws")]
    IdSpaceExhausted(usize),

    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
