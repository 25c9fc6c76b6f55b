//! Error types
//!
//! This module defines the crate-wide error type and the protocol error
//! codes carried by ERROR frames.

use crate::frames::FrameType;
use crate::StreamId;
use std::fmt;

/// Engine errors
///
/// Everything the engine cannot resolve on its own ends up here and is handed
/// to the error sink; nothing unwinds across the frame-dispatch boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection closed by the transport
    #[error("Connection closed")]
    ConnectionClosed,

    /// Not enough bytes for a frame header
    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Frame exceeds the configured maximum length
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Frame type code not handled by this engine
    #[error("Unsupported frame type: 0x{0:02x}")]
    UnsupportedFrameType(u8),

    /// Frame header was readable but the body is malformed
    #[error("Invalid frame on stream {stream_id}: {reason}")]
    InvalidFrame {
        /// Stream the frame was addressed to
        stream_id: StreamId,
        /// What was wrong with it
        reason: String,
    },

    /// Frame referenced a stream that is not open
    #[error("Unknown stream {stream_id} for {frame_type} frame")]
    UnknownStream {
        /// Offending stream id
        stream_id: StreamId,
        /// Type of the frame that referenced it
        frame_type: FrameType,
    },

    /// Request frame reused the id of a stream that is still open
    #[error("Stream {0} is already open")]
    DuplicateStream(StreamId),

    /// Protocol violation not tied to a specific stream
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection-level ERROR frame received from the peer
    #[error("Connection error from peer: {code}: {message}")]
    ConnectionError {
        /// Error code carried by the frame
        code: ErrorCode,
        /// Message carried by the frame
        message: String,
    },

    /// Responder failure that has no stream to report it on
    #[error("Responder error: {0}")]
    Responder(#[from] ResponderError),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Concurrent stream limit reached
    #[error("Too many concurrent streams (limit {0})")]
    TooManyStreams(u32),
}

impl Error {
    /// Whether this error means the connection itself is gone
    ///
    /// Fatal errors terminate every open stream; all other errors stay local
    /// to one stream or are merely reported.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::ConnectionError { .. }
        )
    }

    /// Stream the error is attributable to, if any
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Error::InvalidFrame { stream_id, .. } | Error::UnknownStream { stream_id, .. } => {
                Some(*stream_id)
            }
            Error::DuplicateStream(id) => Some(*id),
            _ => None,
        }
    }
}

/// Error codes carried by ERROR frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// SETUP frame is invalid
    InvalidSetup = 0x001,
    /// Some SETUP parameters are not supported
    UnsupportedSetup = 0x002,
    /// SETUP was rejected by the server
    RejectedSetup = 0x003,
    /// RESUME was rejected by the server
    RejectedResume = 0x004,
    /// Connection is being terminated
    ConnectionError = 0x101,
    /// Connection is being closed gracefully
    ConnectionClose = 0x102,
    /// Application layer logic failed
    ApplicationError = 0x201,
    /// Responder rejected the request
    Rejected = 0x202,
    /// Responder cancelled the request
    Canceled = 0x203,
    /// Request is invalid
    Invalid = 0x204,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x001 => Some(ErrorCode::InvalidSetup),
            0x002 => Some(ErrorCode::UnsupportedSetup),
            0x003 => Some(ErrorCode::RejectedSetup),
            0x004 => Some(ErrorCode::RejectedResume),
            0x101 => Some(ErrorCode::ConnectionError),
            0x102 => Some(ErrorCode::ConnectionClose),
            0x201 => Some(ErrorCode::ApplicationError),
            0x202 => Some(ErrorCode::Rejected),
            0x203 => Some(ErrorCode::Canceled),
            0x204 => Some(ErrorCode::Invalid),
            _ => None,
        }
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::InvalidSetup => "INVALID_SETUP",
            ErrorCode::UnsupportedSetup => "UNSUPPORTED_SETUP",
            ErrorCode::RejectedSetup => "REJECTED_SETUP",
            ErrorCode::RejectedResume => "REJECTED_RESUME",
            ErrorCode::ConnectionError => "CONNECTION_ERROR",
            ErrorCode::ConnectionClose => "CONNECTION_CLOSE",
            ErrorCode::ApplicationError => "APPLICATION_ERROR",
            ErrorCode::Rejected => "REJECTED",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::Invalid => "INVALID",
        }
    }

    /// Whether the code may only appear on stream 0
    pub fn is_connection_level(&self) -> bool {
        self.as_u32() < 0x200
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:03x})", self.name(), self.as_u32())
    }
}

/// Failure reported by a responder or one of its producers
///
/// This is what ends up in the ERROR frame sent on the stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ResponderError {
    code: ErrorCode,
    message: String,
}

impl ResponderError {
    /// Create an error with an explicit code
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ResponderError {
            code,
            message: message.into(),
        }
    }

    /// Application logic failed
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ApplicationError, message)
    }

    /// Request rejected before any processing
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Rejected, message)
    }

    /// Request is invalid
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Invalid, message)
    }

    /// Stream was cancelled
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    /// Interaction model not implemented by the responder
    pub fn unsupported(interaction: &str) -> Self {
        Self::application(format!("{} not implemented", interaction))
    }

    /// Error code
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::InvalidSetup.as_u32(), 0x001);
        assert_eq!(ErrorCode::ApplicationError.as_u32(), 0x201);
        assert_eq!(ErrorCode::Invalid.as_u32(), 0x204);

        assert_eq!(ErrorCode::from_u32(0x102), Some(ErrorCode::ConnectionClose));
        assert_eq!(ErrorCode::from_u32(0x203), Some(ErrorCode::Canceled));
        assert_eq!(ErrorCode::from_u32(0x000), None);
        assert_eq!(ErrorCode::from_u32(0xFFFF_FFFF), None);
    }

    #[test]
    fn test_error_code_name() {
        assert_eq!(ErrorCode::ApplicationError.name(), "APPLICATION_ERROR");
        assert_eq!(ErrorCode::Rejected.name(), "REJECTED");
        assert_eq!(ErrorCode::ApplicationError.to_string(), "APPLICATION_ERROR (0x201)");
    }

    #[test]
    fn test_connection_level_codes() {
        assert!(ErrorCode::ConnectionError.is_connection_level());
        assert!(ErrorCode::InvalidSetup.is_connection_level());
        assert!(!ErrorCode::ApplicationError.is_connection_level());
        assert!(!ErrorCode::Canceled.is_connection_level());
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnknownStream {
            stream_id: 7,
            frame_type: FrameType::RequestN,
        };
        assert_eq!(err.to_string(), "Unknown stream 7 for REQUEST_N frame");
        assert_eq!(err.stream_id(), Some(7));

        let err = ResponderError::application("boom");
        assert_eq!(err.to_string(), "APPLICATION_ERROR (0x201): boom");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::ConnectionClosed.is_connection_fatal());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_connection_fatal());
        assert!(!Error::DuplicateStream(3).is_connection_fatal());
        assert!(!Error::InvalidFrame {
            stream_id: 1,
            reason: "short".to_string()
        }
        .is_connection_fatal());
    }
}
