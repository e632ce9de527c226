//! # Skein Transport
//!
//! Byte-stream plumbing for the Skein RPC transport.
//!
//! This crate provides:
//! - The `Channel` / `ChannelHandler` / `Connector` abstractions the dispatcher
//!   consumes (it never touches sockets itself)
//! - A generic stream channel over any `AsyncRead + AsyncWrite`
//! - TCP and in-memory connectors
//! - Executors for running handler bodies off the I/O tasks
//! - A one-shot scheduler used for request deadlines

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod executor;
pub mod mem;
pub mod scheduler;
pub mod stream;
pub mod tcp;
pub mod worker;

pub use channel::{
    Channel, ChannelHandler, ChannelId, ChannelRef, CloseListener, Connector, TransportError,
    TransportResult, TransportStats, WriteCallback,
};
pub use executor::{DirectExecutor, Executor, RejectedTask, Task, TokioExecutor};
pub use mem::MemoryNetwork;
pub use scheduler::{ScheduledHandle, Scheduler, TokioScheduler};
pub use stream::StreamChannel;
pub use tcp::{TcpConnector, TcpServer};
pub use worker::{WorkerConfig, WorkerPool};

use std::time::Duration;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Disable Nagle's algorithm on TCP channels
    pub nodelay: bool,
    /// TCP keepalive idle time (`None` disables keepalive)
    pub keepalive: Option<Duration>,
    /// Socket receive buffer size (`None` keeps the OS default)
    pub recv_buffer_size: Option<usize>,
    /// Socket send buffer size (`None` keeps the OS default)
    pub send_buffer_size: Option<usize>,
    /// Maximum time to wait for an outbound connect
    pub connect_timeout: Duration,
    /// Initial capacity of the per-channel read buffer
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(Duration::from_secs(60)),
            recv_buffer_size: None,
            send_buffer_size: None,
            connect_timeout: Duration::from_secs(3),
            read_buffer_size: 64 * 1024,
        }
    }
}
