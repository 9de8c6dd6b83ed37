//! Clipboard Error Types
//!
//! Error handling for the clipboard bridge: X11 backend failures, wire
//! decoding problems, format conversion failures and state violations.

use thiserror::Error;

/// Result type for clipboard operations
pub type ClipboardResult<T> = std::result::Result<T, ClipboardError>;

/// Clipboard bridge error types
#[derive(Error, Debug)]
pub enum ClipboardError {
    /// Local windowing backend error (X11 connection, request or reply)
    #[error("backend error: {0}")]
    Backend(String),

    /// No local windowing backend (session running in degraded mode)
    #[error("local clipboard backend unavailable")]
    BackendUnavailable,

    /// Format conversion failed
    #[error("format conversion failed: {0}")]
    FormatConversion(String),

    /// Remote format ID the converter has no handler for
    #[error("unsupported format ID: {0}")]
    UnsupportedFormat(u32),

    /// Invalid UTF-8 data
    #[error("invalid UTF-8 data")]
    InvalidUtf8,

    /// Invalid UTF-16 data
    #[error("invalid UTF-16 data")]
    InvalidUtf16,

    /// Data size exceeded maximum
    #[error("data size {actual} exceeds maximum {max}")]
    DataSizeExceeded {
        /// Actual size in bytes
        actual: usize,
        /// Maximum allowed size in bytes
        max: usize,
    },

    /// Format list payload length is not a multiple of the record size
    #[error("format list length {length} is not a multiple of {record_size}")]
    MalformedFormatList {
        /// Payload length in bytes
        length: usize,
        /// Expected record size in bytes
        record_size: usize,
    },

    /// Truncated or otherwise undecodable PDU
    #[error("malformed PDU: {0}")]
    MalformedPdu(String),

    /// PDU header carries a message type we do not know
    #[error("unknown message type: {0}")]
    UnknownMessageType(u16),

    /// Data response arrived with no local request waiting for it
    #[error("data response without a pending request")]
    UnexpectedDataResponse,

    /// A request of the same kind is already in flight
    #[error("request already in flight for format {0}")]
    RequestInFlight(u32),

    /// Outbound channel closed
    #[error("channel send error")]
    ChannelSend,

    /// Event thread could not be started
    #[error("failed to spawn event thread: {0}")]
    ThreadSpawn(String),

    /// Invalid state for operation
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClipboardError {
    /// Returns true if the session keeps working after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedFormatList { .. }
                | Self::MalformedPdu(_)
                | Self::UnknownMessageType(_)
                | Self::UnexpectedDataResponse
                | Self::RequestInFlight(_)
                | Self::InvalidState(_)
        ) || self.is_format_error()
    }

    /// Returns true if this error indicates a format issue
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::FormatConversion(_)
                | Self::UnsupportedFormat(_)
                | Self::InvalidUtf8
                | Self::InvalidUtf16
                | Self::DataSizeExceeded { .. }
        )
    }

    /// Wrap any displayable backend failure
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}
