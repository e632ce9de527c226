//! Error types for the RPC layer
//!
//! `RpcError` is the failure cause delivered to callers through their
//! `AsyncResult`. It is `Clone` because one cause (a closed connection, a
//! decode failure) may fail many pending requests at once.
//!
//! # Error Categories
//!
//! - **Transient**: may succeed on retry (timeouts, closed connections,
//!   local send failures, executor rejections)
//! - **Permanent**: will not succeed without intervention (bad config,
//!   unserializable payloads, protocol violations)
//!
//! Remote application errors and cancellations are neither; the caller
//! decides.

use crate::error::{FrameError, PromiseError, SyncError};
use skein_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Coarse failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Deadline expired before a response arrived
    Timeout,
    /// The connection carrying the request closed
    ConnectionClosed,
    /// The remote handler reported an error
    RemoteError,
    /// The request could not be written locally
    LocalSend,
    /// The channel delivered a malformed frame
    Decode,
    /// The caller cancelled the request
    Cancelled,
    /// A payload could not be (de)serialized
    Serialization,
    /// Invalid configuration
    Config,
    /// Broken internal invariant
    Internal,
}

/// Errors delivered by the RPC layer
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Deadline expired
    #[error("request [{request_id}] for action [{action}] timed out after {timeout_ms} ms")]
    Timeout {
        /// Action the request was addressed to
        action: String,
        /// Request id
        request_id: u64,
        /// Deadline that expired
        timeout_ms: u64,
    },

    /// The connection closed while the request was pending
    #[error("Connection closed: {0}")]
    ConnectionClosed(Cow<'static, str>),

    /// Remote handler failure
    #[error("Remote error in action [{action}]: {message}")]
    Remote {
        /// Action that failed
        action: String,
        /// Error message reported by the peer
        message: String,
    },

    /// Could not obtain a channel or write to it
    #[error("Send failed: {0}")]
    LocalSend(Cow<'static, str>),

    /// Malformed inbound frame
    #[error("Decode error: {0}")]
    Decode(Cow<'static, str>),

    /// Outbound frame could not be encoded
    #[error("Encode error: {0}")]
    Encode(Cow<'static, str>),

    /// Cancelled by the caller
    #[error("Request cancelled")]
    Cancelled,

    /// Payload (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Internal consistency violation
    #[error("Internal error: {0}")]
    Internal(Cow<'static, str>),
}

impl RpcError {
    /// Classification of this error
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            RpcError::Timeout { .. } => FailureKind::Timeout,
            RpcError::ConnectionClosed(_) => FailureKind::ConnectionClosed,
            RpcError::Remote { .. } => FailureKind::RemoteError,
            RpcError::LocalSend(_) | RpcError::Encode(_) => FailureKind::LocalSend,
            RpcError::Decode(_) => FailureKind::Decode,
            RpcError::Cancelled => FailureKind::Cancelled,
            RpcError::Serialization(_) => FailureKind::Serialization,
            RpcError::InvalidConfig(_) => FailureKind::Config,
            RpcError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout { .. }
                | RpcError::ConnectionClosed(_)
                | RpcError::LocalSend(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RpcError::InvalidConfig(_)
                | RpcError::Serialization(_)
                | RpcError::Decode(_)
                | RpcError::Encode(_)
                | RpcError::Internal(_)
        )
    }

    /// Create a connection-closed error with static context (zero allocation)
    #[must_use]
    pub const fn connection_closed(context: &'static str) -> Self {
        RpcError::ConnectionClosed(Cow::Borrowed(context))
    }

    /// Create an internal error with static context (zero allocation)
    #[must_use]
    pub const fn internal(context: &'static str) -> Self {
        RpcError::Internal(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        RpcError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => RpcError::connection_closed("channel closed"),
            TransportError::InvalidConfig(msg) => RpcError::InvalidConfig(Cow::Owned(msg)),
            other => RpcError::LocalSend(Cow::Owned(other.to_string())),
        }
    }
}

impl From<FrameError> for RpcError {
    fn from(err: FrameError) -> Self {
        RpcError::Decode(Cow::Owned(err.to_string()))
    }
}

impl From<PromiseError> for RpcError {
    fn from(err: PromiseError) -> Self {
        RpcError::Internal(Cow::Owned(err.to_string()))
    }
}

impl From<SyncError<RpcError>> for RpcError {
    fn from(err: SyncError<RpcError>) -> Self {
        match err {
            SyncError::Failed(cause) => cause,
            SyncError::Cancelled => RpcError::Cancelled,
        }
    }
}

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let timeout = RpcError::Timeout {
            action: "echo".into(),
            request_id: 3,
            timeout_ms: 50,
        };
        assert_eq!(timeout.kind(), FailureKind::Timeout);
        assert_eq!(
            timeout.to_string(),
            "request [3] for action [echo] timed out after 50 ms"
        );
        assert_eq!(RpcError::Cancelled.kind(), FailureKind::Cancelled);
        assert_eq!(
            RpcError::Encode(Cow::Borrowed("x")).kind(),
            FailureKind::LocalSend
        );
    }

    #[test]
    fn test_mutual_exclusivity() {
        let errors = [
            RpcError::connection_closed("test"),
            RpcError::LocalSend(Cow::Borrowed("test")),
            RpcError::internal("test"),
            RpcError::invalid_config("test"),
            RpcError::Decode(Cow::Borrowed("test")),
            RpcError::Serialization(Cow::Borrowed("test")),
            RpcError::Remote {
                action: "a".into(),
                message: "m".into(),
            },
            RpcError::Cancelled,
        ];

        for err in &errors {
            assert!(!(err.is_transient() && err.is_permanent()), "{:?}", err);
        }
        assert!(RpcError::connection_closed("x").is_transient());
        assert!(RpcError::internal("x").is_permanent());
        assert!(!RpcError::Cancelled.is_transient());
        assert!(!RpcError::Cancelled.is_permanent());
    }

    #[test]
    fn test_conversions() {
        let err: RpcError = TransportError::Closed.into();
        assert_eq!(err.kind(), FailureKind::ConnectionClosed);

        let err: RpcError = TransportError::ConnectTimeout(10).into();
        assert_eq!(err.kind(), FailureKind::LocalSend);

        let err: RpcError = FrameError::UnknownProtocol(1).into();
        assert_eq!(err.kind(), FailureKind::Decode);

        let err: RpcError = SyncError::<RpcError>::Cancelled.into();
        assert!(matches!(err, RpcError::Cancelled));

        let err: RpcError = SyncError::Failed(RpcError::connection_closed("gone")).into();
        assert_eq!(err.kind(), FailureKind::ConnectionClosed);
    }
}
