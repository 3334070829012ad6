//! Error type shared by the voice session engine.

use tokio_tungstenite::tungstenite::Error as WsError;

use crate::events::CallStatus;

/// Error type for voice session operations
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation not valid while {0:?}")]
    InvalidState(CallStatus),

    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, VoiceError>;
