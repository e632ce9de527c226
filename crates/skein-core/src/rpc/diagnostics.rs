//! Diagnostic channel for failures that have no caller to receive them.
//!
//! One-way handler failures, panics, malformed frames and late responses
//! are reported here instead of propagating into the dispatcher.

use parking_lot::Mutex;
use skein_transport::ChannelId;
use std::fmt;

/// A failure surfaced to the diagnostic channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A handler returned an error
    HandlerFailed {
        /// Action served
        action: String,
        /// Request id (zero for one-way frames)
        request_id: u64,
        /// Error message
        message: String,
    },
    /// A handler panicked
    HandlerPanicked {
        /// Action served
        action: String,
        /// Request id (zero for one-way frames)
        request_id: u64,
        /// Panic payload, if it was a string
        message: String,
    },
    /// No handler is registered for an inbound action
    NoHandler {
        /// Unknown action
        action: String,
    },
    /// The executor refused a handler invocation
    Rejected {
        /// Action refused
        action: String,
        /// Executor's reason
        reason: String,
    },
    /// A channel delivered a malformed frame and was closed
    DecodeFailed {
        /// Offending channel
        channel_id: ChannelId,
        /// Decode error
        message: String,
    },
    /// A response arrived for a request that is no longer pending
    LateResponse {
        /// Request id of the response
        request_id: u64,
    },
    /// A response frame could not be written
    ResponseWriteFailed {
        /// Channel the write was attempted on
        channel_id: ChannelId,
        /// Error message
        message: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::HandlerFailed {
                action,
                request_id,
                message,
            } => write!(f, "handler for [{}] failed on request [{}]: {}", action, request_id, message),
            Diagnostic::HandlerPanicked {
                action,
                request_id,
                message,
            } => write!(f, "handler for [{}] panicked on request [{}]: {}", action, request_id, message),
            Diagnostic::NoHandler { action } => write!(f, "no handler for action [{}]", action),
            Diagnostic::Rejected { action, reason } => {
                write!(f, "handler for [{}] rejected: {}", action, reason)
            }
            Diagnostic::DecodeFailed {
                channel_id,
                message,
            } => write!(f, "decode failure on channel {}: {}", channel_id, message),
            Diagnostic::LateResponse { request_id } => {
                write!(f, "discarded response for unknown request [{}]", request_id)
            }
            Diagnostic::ResponseWriteFailed {
                channel_id,
                message,
            } => write!(f, "response write on channel {} failed: {}", channel_id, message),
        }
    }
}

/// Receives diagnostics. Implementations must not block.
pub trait ErrorReporter: Send + Sync {
    /// Record one diagnostic
    fn report(&self, diagnostic: Diagnostic);
}

/// Logs diagnostics through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::LateResponse { request_id } => {
                tracing::debug!(request_id, "Discarded late response");
            }
            Diagnostic::HandlerPanicked { .. } => tracing::error!("{}", diagnostic),
            _ => tracing::warn!("{}", diagnostic),
        }
    }
}

/// Keeps every diagnostic in memory
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<Diagnostic>>,
}

impl CollectingReporter {
    /// Empty reporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Diagnostics recorded so far
    pub fn events(&self) -> Vec<Diagnostic> {
        self.events.lock().clone()
    }

    /// Number of diagnostics recorded
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, diagnostic: Diagnostic) {
        TracingReporter.report(diagnostic.clone());
        self.events.lock().push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::new();
        reporter.report(Diagnostic::NoHandler {
            action: "missing".into(),
        });
        reporter.report(Diagnostic::LateResponse { request_id: 4 });

        assert_eq!(reporter.len(), 2);
        assert_eq!(
            reporter.events()[1],
            Diagnostic::LateResponse { request_id: 4 }
        );
    }

    #[test]
    fn test_display() {
        let d = Diagnostic::HandlerFailed {
            action: "log".into(),
            request_id: 0,
            message: "boom".into(),
        };
        assert_eq!(d.to_string(), "handler for [log] failed on request [0]: boom");
    }
}
