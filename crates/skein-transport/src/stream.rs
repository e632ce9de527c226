//! Generic byte-stream channel.
//!
//! `StreamChannel` drives any `AsyncRead + AsyncWrite` stream (TCP socket,
//! in-memory duplex pipe) with two tasks:
//!
//! ```text
//!  write(bytes, cb) ──▶ mpsc queue ──▶ writer task ──▶ stream
//!                                                        │
//!  handler.on_read ◀── reader task ◀─────────────────────┘
//! ```
//!
//! The queue keeps writes in call order and never blocks the caller. The
//! reader delivers chunks strictly in stream order and calls
//! `ChannelHandler::on_closed` exactly once when it stops.

use crate::channel::{
    Channel, ChannelHandler, ChannelId, ChannelRef, CloseListener, StatsCounters,
    TransportError, TransportStats, WriteCallback, next_channel_id,
};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};

type WriteRequest = (Bytes, WriteCallback);

#[derive(Default)]
struct CloseState {
    closed: bool,
    /// Error that triggered a close from the writer side
    error: Option<TransportError>,
    cause: Option<TransportError>,
    listeners: Vec<CloseListener>,
}

/// Channel over an arbitrary async byte stream
pub struct StreamChannel {
    id: ChannelId,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    writer: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
    open: AtomicBool,
    shutdown: Notify,
    close_state: Mutex<CloseState>,
    stats: StatsCounters,
}

impl StreamChannel {
    /// Start driving `io` and return the channel handle.
    ///
    /// Must be called from within a tokio runtime. `handler.on_open` runs on
    /// the reader task before the first `on_read`.
    pub fn spawn<S>(
        io: S,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        handler: Arc<dyn ChannelHandler>,
        read_buffer_size: usize,
    ) -> Arc<StreamChannel>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(StreamChannel {
            id: next_channel_id(),
            local_addr,
            peer_addr,
            writer: Mutex::new(Some(tx)),
            open: AtomicBool::new(true),
            shutdown: Notify::new(),
            close_state: Mutex::new(CloseState::default()),
            stats: StatsCounters::default(),
        });

        let (reader, writer) = tokio::io::split(io);

        tokio::spawn(Self::write_loop(Arc::clone(&channel), writer, rx));
        tokio::spawn(Self::read_loop(
            Arc::clone(&channel),
            reader,
            handler,
            read_buffer_size.max(1024),
        ));

        tracing::debug!(
            channel = channel.id,
            peer = ?peer_addr,
            "Stream channel started"
        );

        channel
    }

    async fn write_loop<W>(
        channel: Arc<StreamChannel>,
        mut writer: W,
        mut rx: mpsc::UnboundedReceiver<WriteRequest>,
    ) where
        W: AsyncWrite + Unpin,
    {
        while let Some((bytes, on_complete)) = rx.recv().await {
            match writer.write_all(&bytes).await {
                Ok(()) => {
                    channel.stats.record_send(bytes.len());
                    on_complete(Ok(()));
                }
                Err(e) => {
                    channel.stats.record_send_error();
                    let err = TransportError::from(e);
                    tracing::debug!(channel = channel.id, error = %err, "Write failed");
                    on_complete(Err(err.clone()));
                    channel.fail(err);

                    rx.close();
                    while let Some((_, on_complete)) = rx.recv().await {
                        on_complete(Err(TransportError::Closed));
                    }
                    return;
                }
            }
        }

        let _ = writer.shutdown().await;
    }

    async fn read_loop<R>(
        channel: Arc<StreamChannel>,
        mut reader: R,
        handler: Arc<dyn ChannelHandler>,
        read_buffer_size: usize,
    ) where
        R: AsyncRead + Unpin,
    {
        let me: ChannelRef = channel.clone();
        handler.on_open(&me);

        let mut buf = BytesMut::with_capacity(read_buffer_size);
        let cause = loop {
            if buf.capacity() - buf.len() < read_buffer_size / 4 {
                buf.reserve(read_buffer_size);
            }

            // close() from inside on_read must stop delivery before any
            // bytes already buffered are read
            if !channel.is_open() {
                break channel.close_state.lock().error.take();
            }

            tokio::select! {
                biased;
                _ = channel.shutdown.notified() => {
                    break channel.close_state.lock().error.take();
                }
                res = reader.read_buf(&mut buf) => match res {
                    Ok(0) => break None,
                    Ok(n) => {
                        channel.stats.record_recv(n);
                        handler.on_read(&me, buf.split().freeze());
                    }
                    Err(e) => {
                        channel.stats.record_recv_error();
                        break Some(TransportError::from(e));
                    }
                },
            }
        };

        channel.finish(cause.clone());
        handler.on_closed(&me, cause);
    }

    fn shut_writes(&self) {
        self.open.store(false, Ordering::Release);
        self.writer.lock().take();
    }

    /// Close from the writer side, recording the error as the close cause
    fn fail(&self, err: TransportError) {
        self.close_state.lock().error = Some(err);
        self.close();
    }

    /// Mark closed and fire close listeners (reader task only)
    fn finish(&self, cause: Option<TransportError>) {
        self.shut_writes();
        let listeners = {
            let mut state = self.close_state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.cause = cause.clone();
            std::mem::take(&mut state.listeners)
        };

        tracing::debug!(channel = self.id, cause = ?cause, "Stream channel closed");

        for listener in listeners {
            listener(cause.clone());
        }
    }
}

impl Channel for StreamChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn write(&self, bytes: Bytes, on_complete: WriteCallback) {
        let guard = self.writer.lock();
        match guard.as_ref() {
            Some(tx) => {
                if let Err(mpsc::error::SendError((_, on_complete))) = tx.send((bytes, on_complete))
                {
                    drop(guard);
                    on_complete(Err(TransportError::Closed));
                }
            }
            None => {
                drop(guard);
                on_complete(Err(TransportError::Closed));
            }
        }
    }

    fn close(&self) {
        self.shut_writes();
        self.shutdown.notify_one();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn add_close_listener(&self, listener: CloseListener) {
        let mut state = self.close_state.lock();
        if state.closed {
            let cause = state.cause.clone();
            drop(state);
            listener(cause);
        } else {
            state.listeners.push(listener);
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}
