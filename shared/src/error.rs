//! Error types for the chat wire protocol

use thiserror::Error;

/// Errors that can occur while decoding or encoding chat frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame is not valid JSON
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    /// Frame is valid JSON but not an object
    #[error("Frame is not a JSON object")]
    NotAnObject,
}

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
