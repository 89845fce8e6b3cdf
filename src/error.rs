//! Error types shared across the session and the audio pipeline.

use tokio_tungstenite::tungstenite::Error as WsError;

/// Error type for session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no credentials")]
    MissingCredentials,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("connection timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    /// A `disconnect()` landed while this `connect()` was still in flight.
    #[error("connect cancelled by disconnect")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Error type for audio format handling and device setup
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("audio format mismatch: expected {expected}, got {actual}")]
    FormatMismatch { expected: String, actual: String },

    #[error("audio device error: {0}")]
    Device(String),

    #[error("resampler error: {0}")]
    Resample(String),
}
