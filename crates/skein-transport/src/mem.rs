//! In-process transport.
//!
//! `MemoryNetwork` maps `(host, port)` pairs to listening handlers. Connecting
//! creates a `tokio::io::duplex` pipe and wraps each end in a
//! [`StreamChannel`], so the byte-stream semantics match TCP exactly without
//! touching the OS network stack.

use crate::channel::{ChannelHandler, ChannelRef, Connector, TransportError, TransportResult};
use crate::stream::StreamChannel;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

const DEFAULT_PIPE_CAPACITY: usize = 256 * 1024;

/// Registry of in-memory listeners, usable as a [`Connector`]
#[derive(Clone)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<(String, u16), Arc<dyn ChannelHandler>>>,
    pipe_capacity: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    /// Create a network whose pipes buffer at most `capacity` bytes per
    /// direction
    pub fn with_pipe_capacity(capacity: usize) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            pipe_capacity: capacity.max(1),
        }
    }

    /// Accept channels addressed to `host:port` with `handler`.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the address is already taken.
    pub fn listen(
        &self,
        host: &str,
        port: u16,
        handler: Arc<dyn ChannelHandler>,
    ) -> TransportResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.listeners.entry((host.to_string(), port)) {
            Entry::Occupied(_) => Err(TransportError::BindFailed(format!(
                "{}:{} already in use",
                host, port
            ))),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                tracing::debug!("Memory listener registered on {}:{}", host, port);
                Ok(())
            }
        }
    }

    /// Stop accepting on `host:port`. Established channels stay open.
    pub fn unlisten(&self, host: &str, port: u16) -> bool {
        self.listeners.remove(&(host.to_string(), port)).is_some()
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        handler: Arc<dyn ChannelHandler>,
    ) -> TransportResult<ChannelRef> {
        let acceptor = self
            .listeners
            .get(&(host.to_string(), port))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("{}:{} not listening", host, port))
            })?;

        let (client, server) = tokio::io::duplex(self.pipe_capacity);
        let _server_side = StreamChannel::spawn(server, None, None, acceptor, 16 * 1024);
        let client_side = StreamChannel::spawn(client, None, None, handler, 16 * 1024);
        Ok(client_side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<Bytes>);

    impl ChannelHandler for Forward {
        fn on_read(&self, channel: &ChannelRef, bytes: Bytes) {
            let _ = self.0.send(bytes.clone());
            channel.write(bytes, Box::new(|_| {}));
        }

        fn on_closed(&self, _channel: &ChannelRef, _cause: Option<TransportError>) {}
    }

    #[tokio::test]
    async fn test_connect_to_listener() {
        let network = MemoryNetwork::new();
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        network
            .listen("node-a", 7000, Arc::new(Forward(server_tx)))
            .unwrap();

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let channel = network
            .connect("node-a", 7000, Arc::new(Forward(client_tx)))
            .await
            .unwrap();

        channel.write(Bytes::from_static(b"hello"), Box::new(|_| {}));
        assert_eq!(server_rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(client_rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
        channel.close();
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = network.connect("nowhere", 1, Arc::new(Forward(tx))).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[test]
    fn test_listen_twice_fails() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        network
            .listen("node-a", 1, Arc::new(Forward(tx.clone())))
            .unwrap();
        assert!(matches!(
            network.listen("node-a", 1, Arc::new(Forward(tx))),
            Err(TransportError::BindFailed(_))
        ));
        assert!(network.unlisten("node-a", 1));
        assert!(!network.unlisten("node-a", 1));
    }
}
