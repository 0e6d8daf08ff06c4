//! Codec for the client-facing JSON frames.
//!
//! Inbound frames are decoded from raw bytes (text or binary WebSocket
//! messages); outbound frames are encoded to a JSON string.

use thiserror::Error;

use crate::frames::{ControlFrame, ServerFrame};

/// Default maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Frame is not valid JSON or does not match a known shape.
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame parsed but carries unusable values.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Decode a control frame using the default size limit.
///
/// # Errors
///
/// Returns an error if the frame is too large, malformed, or has an empty channel.
pub fn decode(data: &[u8]) -> Result<ControlFrame, ProtocolError> {
    FrameCodec::new().decode(data)
}

/// Encode a server frame to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &ServerFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Codec carrying the inbound size limit of a session.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    /// Create a new codec with the default limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with a custom inbound size limit.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode a control frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large, malformed, or has an empty channel.
    pub fn decode(&self, data: &[u8]) -> Result<ControlFrame, ProtocolError> {
        if data.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }

        let frame: ControlFrame = serde_json::from_slice(data)?;
        if frame.channel().is_empty() {
            return Err(ProtocolError::Invalid("missing channel".into()));
        }
        Ok(frame)
    }

    /// Encode a server frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, frame: &ServerFrame) -> Result<String, ProtocolError> {
        encode(frame)
    }
}
