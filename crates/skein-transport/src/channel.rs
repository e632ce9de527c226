//! Channel abstraction for byte-stream transports.
//!
//! A `Channel` is one ordered, reliable byte stream to a peer. The dispatcher
//! writes encoded frames to it and receives raw bytes back through a
//! `ChannelHandler`; framing and request correlation live above this layer.
//! `Connector` opens outbound channels to a host and port.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transport layer errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(String),

    /// Channel is closed
    #[error("Channel is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connect did not complete in time
    #[error("Connect timed out after {0} ms")]
    ConnectTimeout(u64),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Process-unique channel identifier
pub type ChannelId = u64;

/// Shared handle to a channel
pub type ChannelRef = Arc<dyn Channel>;

/// Callback invoked once a queued write has been flushed (or has failed)
pub type WriteCallback = Box<dyn FnOnce(TransportResult<()>) + Send + 'static>;

/// Callback invoked once when a channel closes, with the cause if it was not
/// a local close
pub type CloseListener = Box<dyn FnOnce(Option<TransportError>) + Send + 'static>;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh process-unique channel id
pub fn next_channel_id() -> ChannelId {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// One ordered, reliable byte stream to a peer.
///
/// Writes are fire-and-forget: they are queued in order and `on_complete`
/// reports the outcome. Implementations must never block the caller.
pub trait Channel: Send + Sync + fmt::Debug {
    /// Process-unique identifier of this channel
    fn id(&self) -> ChannelId;

    /// Queue `bytes` for transmission. Bytes from successive calls are
    /// written in call order.
    fn write(&self, bytes: Bytes, on_complete: WriteCallback);

    /// Close the channel. Idempotent; close listeners fire exactly once.
    fn close(&self);

    /// Whether the channel still accepts writes
    fn is_open(&self) -> bool;

    /// Local socket address, if the transport has one
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote socket address, if the transport has one
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Register a listener invoked once when the channel closes. If the
    /// channel is already closed the listener runs immediately.
    fn add_close_listener(&self, listener: CloseListener);

    /// Snapshot of this channel's traffic counters
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Receives events from channels.
///
/// `on_read` is invoked from the channel's reader task, strictly in stream
/// order; `on_closed` is invoked exactly once after the last `on_read`.
pub trait ChannelHandler: Send + Sync {
    /// A channel became active
    fn on_open(&self, _channel: &ChannelRef) {}

    /// Bytes arrived on `channel`
    fn on_read(&self, channel: &ChannelRef, bytes: Bytes);

    /// `channel` closed; `cause` is `None` for a clean close
    fn on_closed(&self, channel: &ChannelRef, cause: Option<TransportError>);
}

/// Opens outbound channels.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel to `host:port`, delivering its events to `handler`.
    ///
    /// # Errors
    /// Returns `TransportError` if the peer is unreachable or the connect
    /// times out.
    async fn connect(
        &self,
        host: &str,
        port: u16,
        handler: Arc<dyn ChannelHandler>,
    ) -> TransportResult<ChannelRef>;
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total writes flushed
    pub writes: u64,
    /// Total reads delivered to the handler
    pub reads: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

/// Lock-free counters backing `TransportStats`
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counters() {
        let counters = StatsCounters::default();
        assert_eq!(counters.snapshot().bytes_sent, 0);

        counters.record_send(100);
        counters.record_send(50);
        counters.record_recv(200);
        counters.record_send_error();
        counters.record_recv_error();

        let stats = counters.snapshot();
        assert_eq!(stats.bytes_sent, 150);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.bytes_received, 200);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.send_errors, 1);
        assert_eq!(stats.recv_errors, 1);
    }

    #[test]
    fn test_channel_ids_unique() {
        let a = next_channel_id();
        let b = next_channel_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Channel is closed");

        let err = TransportError::BindFailed("test".to_string());
        assert!(err.to_string().contains("Failed to bind"));

        let err = TransportError::ConnectionFailed("test".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let err = TransportError::ConnectTimeout(250);
        assert!(err.to_string().contains("250 ms"));
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "test");
        let transport_err = TransportError::from(io_err);

        assert!(matches!(transport_err, TransportError::Io(_)));
    }
}
