//! Transport error types.

use thiserror::Error;

/// Broad classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unexpected header.
    Protocol,
    /// A value that cannot be represented on the wire.
    Validation,
    /// Connect, send or receive failure.
    Connection,
    /// No response within the deadline.
    Timeout,
}

/// Errors raised by the wire codec and TCP connections.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer did not accept the connection in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address being dialed.
        addr: String,
        /// Connect timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A send or receive made no progress in time, between frames.
    #[error("no data within {timeout_ms}ms")]
    IoTimeout {
        /// I/O timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A receive timed out after part of a frame was consumed. The
    /// connection can no longer be framed and must be dropped.
    #[error("timed out after {timeout_ms}ms with {received} of {expected} frame bytes read")]
    StalledFrame {
        /// Bytes of the frame part read before the timeout.
        received: usize,
        /// Bytes the frame part needed.
        expected: usize,
        /// I/O timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The peer closed the connection mid-frame.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The header could not be decoded.
    #[error("invalid header: {reason}")]
    InvalidHeader {
        /// What was wrong with it.
        reason: String,
    },

    /// Sequence number wider than 31 bits.
    #[error("sequence number {sequence} does not fit in 31 bits")]
    SequenceOutOfRange {
        /// The rejected sequence number.
        sequence: u32,
    },

    /// Payload longer than the frame limit.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Announced or actual payload size.
        size: u64,
        /// Largest accepted payload size.
        max_size: u32,
    },

    /// Payload bytes are not UTF-8.
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    /// Underlying socket error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Maps the error onto its failure class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::ConnectionTimeout { .. }
            | TransportError::IoTimeout { .. }
            | TransportError::StalledFrame { .. } => ErrorKind::Timeout,
            TransportError::ConnectionClosed | TransportError::IoError(_) => ErrorKind::Connection,
            TransportError::InvalidHeader { .. } | TransportError::InvalidUtf8 => ErrorKind::Protocol,
            TransportError::SequenceOutOfRange { .. } | TransportError::PayloadTooLarge { .. } => {
                ErrorKind::Validation
            }
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(TransportError::IoTimeout { timeout_ms: 5 }.kind(), ErrorKind::Timeout);
        assert_eq!(
            TransportError::ConnectionTimeout {
                addr: "127.0.0.1:1".to_string(),
                timeout_ms: 5
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(TransportError::ConnectionClosed.kind(), ErrorKind::Connection);
        assert_eq!(
            TransportError::IoError(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "x")).kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            TransportError::InvalidHeader {
                reason: "short".to_string()
            }
            .kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            TransportError::SequenceOutOfRange { sequence: u32::MAX }.kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::PayloadTooLarge {
            size: 10,
            max_size: 5,
        };
        assert_eq!(err.to_string(), "payload too large: 10 bytes (max 5)");
    }
}
