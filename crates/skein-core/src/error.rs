//! Error types for the Skein core.

use thiserror::Error;

/// Frame encoding and decoding errors.
///
/// Every decode error is fatal to the channel the bytes arrived on: the
/// stream position is lost and cannot be resynchronized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Protocol id does not identify this wire format
    #[error("unknown protocol id: 0x{0:02X}")]
    UnknownProtocol(u8),

    /// Protocol version not supported by this decoder
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Invalid handle type byte
    #[error("invalid handle type: 0x{0:02X}")]
    InvalidHandleType(u8),

    /// Invalid message type byte
    #[error("invalid message type: 0x{0:02X}")]
    InvalidMessageType(u8),

    /// Invalid encryption type byte
    #[error("invalid encryption type: 0x{0:02X}")]
    InvalidEncryption(u8),

    /// Invalid response status
    #[error("invalid response status: {0}")]
    InvalidStatus(u16),

    /// Negative length field
    #[error("negative {field} length: {value}")]
    NegativeLength {
        /// Which length field
        field: &'static str,
        /// Value on the wire
        value: i32,
    },

    /// Variable header plus payload exceeds the configured ceiling
    #[error("frame too large: {length} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Declared length
        length: usize,
        /// Configured ceiling
        max: usize,
    },

    /// Variable header block could not be parsed
    #[error("malformed variable header: {0}")]
    MalformedHeader(&'static str),

    /// Header key uses the reserved `:` prefix
    #[error("reserved header key: {0}")]
    ReservedHeader(String),

    /// Header key or value longer than a u16 length prefix allows
    #[error("header entry too long: {0} bytes")]
    HeaderTooLong(usize),

    /// CRC32C trailer does not match the frame contents
    #[error("checksum mismatch: expected {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame
        expected: u32,
        /// Checksum computed over the received bytes
        actual: u32,
    },
}

/// Misuse of an `AsyncResult`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PromiseError {
    /// The result already reached a terminal state
    #[error("result already complete")]
    AlreadyComplete,

    /// Progress reported with `done > total`
    #[error("invalid progress: {done} of {total}")]
    InvalidProgress {
        /// Units completed
        done: u64,
        /// Total units
        total: u64,
    },
}

/// Why `AsyncResult::sync` did not produce a value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError<E> {
    /// The operation failed with this cause
    #[error("operation failed: {0}")]
    Failed(E),

    /// The operation was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

impl<E> SyncError<E> {
    /// Returns the failure cause, if any
    pub fn into_cause(self) -> Option<E> {
        match self {
            SyncError::Failed(e) => Some(e),
            SyncError::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_error_display() {
        let err = FrameError::UnknownProtocol(0x42);
        assert_eq!(err.to_string(), "unknown protocol id: 0x42");

        let err = FrameError::NegativeLength {
            field: "payload",
            value: -1,
        };
        assert_eq!(err.to_string(), "negative payload length: -1");

        let err = FrameError::ChecksumMismatch {
            expected: 0xdeadbeef,
            actual: 1,
        };
        assert!(err.to_string().contains("deadbeef"));
    }

    #[test]
    fn test_sync_error_cause() {
        let err: SyncError<&str> = SyncError::Failed("boom");
        assert_eq!(err.clone().into_cause(), Some("boom"));
        assert_eq!(err.to_string(), "operation failed: boom");
        assert_eq!(SyncError::<&str>::Cancelled.into_cause(), None);
    }
}
