//! Error type shared by the tracking library.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackingError {
    /// The selected strategy does not implement the requested operation.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// Invalid or incomplete configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A datagram that does not follow the agent packet layout.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TrackingError>;
